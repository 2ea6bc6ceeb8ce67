//! Agent memory seam: tagged notes, key/value recall, chat history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub content: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `user`, `assistant` or `system`.
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Storage backends (vector stores, databases) implement this outside the
/// crate. Every operation is scoped to the current session.
#[async_trait]
pub trait Memory: Send + Sync {
    async fn store(&self, content: &str, tags: &[String]) -> anyhow::Result<()>;

    /// Best matches first, at most `limit` of them.
    async fn query(&self, query: &str, limit: usize) -> anyhow::Result<Vec<MemoryRecord>>;

    async fn remember(&self, key: &str, value: Value) -> anyhow::Result<()>;

    async fn recall(&self, key: &str) -> anyhow::Result<Option<Value>>;

    async fn add_message(&self, message: ChatMessage) -> anyhow::Result<()>;

    /// The most recent `limit` messages, oldest first.
    async fn history(&self, limit: usize) -> anyhow::Result<Vec<ChatMessage>>;

    async fn set_session(&self, session_id: &str) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Session {
        notes: Vec<MemoryRecord>,
        values: HashMap<String, Value>,
        history: Vec<ChatMessage>,
    }

    /// Substring-matching memory keyed by session.
    #[derive(Default)]
    pub(crate) struct ScratchMemory {
        session: Mutex<String>,
        sessions: Mutex<HashMap<String, Session>>,
        closed: Mutex<bool>,
    }

    impl ScratchMemory {
        fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> T) -> anyhow::Result<T> {
            if *self.closed.lock() {
                anyhow::bail!("memory is closed");
            }
            let key = self.session.lock().clone();
            let mut sessions = self.sessions.lock();
            Ok(f(sessions.entry(key).or_default()))
        }
    }

    #[async_trait]
    impl Memory for ScratchMemory {
        async fn store(&self, content: &str, tags: &[String]) -> anyhow::Result<()> {
            self.with_session(|s| {
                s.notes.push(MemoryRecord {
                    content: content.to_string(),
                    score: 1.0,
                    tags: tags.to_vec(),
                    created_at: Utc::now(),
                })
            })
        }

        async fn query(&self, query: &str, limit: usize) -> anyhow::Result<Vec<MemoryRecord>> {
            self.with_session(|s| {
                s.notes
                    .iter()
                    .filter(|n| n.content.contains(query))
                    .take(limit)
                    .cloned()
                    .collect()
            })
        }

        async fn remember(&self, key: &str, value: Value) -> anyhow::Result<()> {
            self.with_session(|s| {
                s.values.insert(key.to_string(), value);
            })
        }

        async fn recall(&self, key: &str) -> anyhow::Result<Option<Value>> {
            self.with_session(|s| s.values.get(key).cloned())
        }

        async fn add_message(&self, message: ChatMessage) -> anyhow::Result<()> {
            self.with_session(|s| s.history.push(message))
        }

        async fn history(&self, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
            self.with_session(|s| {
                let skip = s.history.len().saturating_sub(limit);
                s.history[skip..].to_vec()
            })
        }

        async fn set_session(&self, session_id: &str) -> anyhow::Result<()> {
            *self.session.lock() = session_id.to_string();
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            *self.closed.lock() = true;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScratchMemory;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let memory = ScratchMemory::default();
        memory.set_session("s1").await.unwrap();
        memory.store("paris is in france", &["geo".into()]).await.unwrap();
        memory.remember("lang", json!("fr")).await.unwrap();

        memory.set_session("s2").await.unwrap();
        assert!(memory.query("paris", 5).await.unwrap().is_empty());
        assert_eq!(memory.recall("lang").await.unwrap(), None);

        memory.set_session("s1").await.unwrap();
        let hits = memory.query("paris", 5).await.unwrap();
        assert_eq!(hits[0].tags, vec!["geo"]);
        assert_eq!(memory.recall("lang").await.unwrap(), Some(json!("fr")));
    }

    #[tokio::test]
    async fn test_history_keeps_latest() {
        let memory = ScratchMemory::default();
        for i in 0..4 {
            memory
                .add_message(ChatMessage::new("user", format!("msg {}", i)))
                .await
                .unwrap();
        }
        let last: Vec<String> = memory
            .history(2)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(last, vec!["msg 2", "msg 3"]);

        memory.close().await.unwrap();
        assert!(memory.store("late", &[]).await.is_err());
    }

    #[test]
    fn test_message_roles_serialize() {
        let memory = ScratchMemory::default();
        tokio_test::block_on(memory.add_message(ChatMessage::new("system", "be terse"))).unwrap();
        let history = tokio_test::block_on(memory.history(10)).unwrap();
        let json = serde_json::to_value(&history[0]).unwrap();
        assert_eq!(json["role"], "system");
        assert!(json["created_at"].is_string());
    }
}
