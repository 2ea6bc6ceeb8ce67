//! The routed unit of work moved between agents.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Well-known metadata keys
// ---------------------------------------------------------------------------

/// Metadata key naming the agent an event should be dispatched to.
pub const ROUTE_KEY: &str = "route";
/// Metadata key carrying the session an event chain belongs to.
pub const SESSION_ID_KEY: &str = "session_id";
/// Metadata key carrying `success` or `error` on synthesized events.
pub const STATUS_KEY: &str = "status";
/// Metadata key carrying how many times an event has been retried.
pub const RETRY_COUNT_KEY: &str = "retry_count";
/// Metadata key carrying how many more synthesized hops a chain may take.
pub const HOPS_REMAINING_KEY: &str = "hops_remaining";

/// Status value stamped on follow-up events produced by a successful agent.
pub const STATUS_SUCCESS: &str = "success";
/// Status value stamped on routed error events.
pub const STATUS_ERROR: &str = "error";

/// Event payload: string-keyed map of arbitrary JSON values.
pub type EventData = HashMap<String, Value>;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A routed, queueable unit of work.
///
/// Events have value semantics: cloning produces an independent copy, and
/// derived events (follow-ups, error events, retries) are always new values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    target_agent_id: String,
    #[serde(default)]
    source_agent_id: String,
    #[serde(default)]
    data: EventData,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl Event {
    /// Create an event with a fresh UUID and the current timestamp.
    pub fn new(
        target_agent_id: impl Into<String>,
        data: EventData,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), target_agent_id, data, metadata)
    }

    /// Create an event with a caller-chosen ID.
    pub fn with_id(
        id: impl Into<String>,
        target_agent_id: impl Into<String>,
        data: EventData,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            target_agent_id: target_agent_id.into(),
            source_agent_id: String::new(),
            data,
            metadata,
        }
    }

    /// Shorthand for an event routed to `route` within `session_id`.
    pub fn routed(route: &str, session_id: &str, data: EventData) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(ROUTE_KEY.to_string(), route.to_string());
        metadata.insert(SESSION_ID_KEY.to_string(), session_id.to_string());
        Self::new(route, data, metadata)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn target_agent_id(&self) -> &str {
        &self.target_agent_id
    }

    pub fn set_target_agent_id(&mut self, id: impl Into<String>) {
        self.target_agent_id = id.into();
    }

    pub fn source_agent_id(&self) -> &str {
        &self.source_agent_id
    }

    pub fn set_source_agent_id(&mut self, id: impl Into<String>) {
        self.source_agent_id = id.into();
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    /// Owned copy of the payload.
    pub fn data_copy(&self) -> EventData {
        self.data.clone()
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Owned copy of the metadata map.
    pub fn metadata_copy(&self) -> HashMap<String, String> {
        self.metadata.clone()
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Session ID from metadata, or `""` when absent.
    pub fn session_id(&self) -> &str {
        self.metadata_value(SESSION_ID_KEY).unwrap_or_default()
    }

    /// Routing key from metadata, if present and non-empty.
    pub fn route(&self) -> Option<&str> {
        self.metadata_value(ROUTE_KEY).filter(|r| !r.is_empty())
    }

    /// Retry count parsed from metadata; missing or malformed values count as 0.
    pub fn retry_count(&self) -> u32 {
        self.metadata_value(RETRY_COUNT_KEY)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Remaining hop budget, if the event carries one.
    pub fn hops_remaining(&self) -> Option<u32> {
        self.metadata_value(HOPS_REMAINING_KEY)
            .and_then(|v| v.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_event_has_unique_id() {
        let a = Event::new("writer", EventData::new(), HashMap::new());
        let b = Event::new("writer", EventData::new(), HashMap::new());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.target_agent_id(), "writer");
        assert_eq!(a.source_agent_id(), "");
    }

    #[test]
    fn test_copies_are_independent() {
        let mut event = Event::routed("writer", "s1", EventData::new());
        let mut data = event.data_copy();
        data.insert("x".into(), json!(1));
        let mut meta = event.metadata_copy();
        meta.insert("extra".into(), "y".into());
        assert!(event.data().is_empty());
        assert!(event.metadata_value("extra").is_none());

        event.set_data("x", json!(2));
        assert_eq!(data["x"], json!(1));
    }

    #[test]
    fn test_route_and_session_accessors() {
        let mut event = Event::routed("writer", "session-7", EventData::new());
        assert_eq!(event.route(), Some("writer"));
        assert_eq!(event.session_id(), "session-7");

        event.set_metadata(ROUTE_KEY, "");
        assert_eq!(event.route(), None);
    }

    #[test]
    fn test_retry_count_parsing() {
        let mut event = Event::routed("writer", "s", EventData::new());
        assert_eq!(event.retry_count(), 0);
        event.set_metadata(RETRY_COUNT_KEY, "12");
        assert_eq!(event.retry_count(), 12);
        event.set_metadata(RETRY_COUNT_KEY, "not-a-number");
        assert_eq!(event.retry_count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let mut event = Event::with_id("evt-1", "writer", EventData::new(), HashMap::new());
        event.set_data("topic", json!("rust"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["id"], "evt-1");
        assert_eq!(value["target_agent_id"], "writer");
        assert_eq!(value["data"]["topic"], "rust");
    }
}
