//! Execution trace capture.
//!
//! Tracing is wired in through ordinary callbacks: [`register_trace_hooks`]
//! installs one callback per hook point that turns the callback arguments
//! into a [`TraceEntry`] and hands it to a [`TraceLogger`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handler::AgentResult;
use crate::hooks::{CallbackArgs, CallbackRegistry, HookPoint, RegistryError};
use crate::state::State;

/// Session key used for entries whose event carries no session ID.
pub const DEFAULT_SESSION: &str = "default_session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEntryType {
    EventStart,
    EventEnd,
    AgentStart,
    AgentEnd,
    AgentError,
}

/// One observation made at a hook point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub entry_type: TraceEntryType,
    pub event_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub hook: HookPoint,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_agent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_result: Option<AgentResult>,
}

impl TraceEntry {
    fn from_args(entry_type: TraceEntryType, args: &CallbackArgs<'_>, state: &State) -> Self {
        Self {
            timestamp: Utc::now(),
            entry_type,
            event_id: args.event.id().to_string(),
            session_id: args.event.session_id().to_string(),
            agent_id: args.agent_id.to_string(),
            state: Some(state.clone()),
            error: args.error.map(str::to_string),
            hook: args.hook,
            target_agent_id: args.event.target_agent_id().to_string(),
            source_agent_id: args.event.source_agent_id().to_string(),
            agent_result: args.agent_result.cloned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace storage failure: {0}")]
    Storage(String),
}

/// Sink for trace entries.
pub trait TraceLogger: Send + Sync {
    fn log(&self, entry: TraceEntry) -> Result<(), TraceError>;

    /// Entries recorded for `session_id`, oldest first.
    fn get_trace(&self, session_id: &str) -> Result<Vec<TraceEntry>, TraceError>;
}

/// Keeps every entry in memory, grouped by session.
#[derive(Debug, Default)]
pub struct InMemoryTraceLogger {
    sessions: DashMap<String, Vec<TraceEntry>>,
}

impl InMemoryTraceLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}

impl TraceLogger for InMemoryTraceLogger {
    fn log(&self, entry: TraceEntry) -> Result<(), TraceError> {
        let session = if entry.session_id.is_empty() {
            DEFAULT_SESSION.to_string()
        } else {
            entry.session_id.clone()
        };
        self.sessions.entry(session).or_default().push(entry);
        Ok(())
    }

    fn get_trace(&self, session_id: &str) -> Result<Vec<TraceEntry>, TraceError> {
        let session = if session_id.is_empty() {
            DEFAULT_SESSION
        } else {
            session_id
        };
        let mut entries = self
            .sessions
            .get(session)
            .map(|entries| entries.value().clone())
            .unwrap_or_default();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTraceLogger;

impl TraceLogger for NoopTraceLogger {
    fn log(&self, _entry: TraceEntry) -> Result<(), TraceError> {
        Ok(())
    }

    fn get_trace(&self, _session_id: &str) -> Result<Vec<TraceEntry>, TraceError> {
        Ok(Vec::new())
    }
}

/// Register the trace callbacks on `registry`.
///
/// The callbacks never fail: a logger error is reported through `log` and
/// the pipeline carries on.
pub fn register_trace_hooks(
    registry: &CallbackRegistry,
    logger: Arc<dyn TraceLogger>,
) -> Result<(), RegistryError> {
    let hooks = [
        (HookPoint::BeforeEventHandling, "trace_before_event", TraceEntryType::EventStart),
        (HookPoint::BeforeAgentRun, "trace_before_agent", TraceEntryType::AgentStart),
        (HookPoint::AfterAgentRun, "trace_agent_end", TraceEntryType::AgentEnd),
        (HookPoint::AgentError, "trace_agent_error", TraceEntryType::AgentError),
        (HookPoint::AfterEventHandling, "trace_after_event", TraceEntryType::EventEnd),
    ];
    for (hook, name, entry_type) in hooks {
        let logger = logger.clone();
        registry.register(hook, name, move |args, state| {
            if let Err(err) = logger.log(TraceEntry::from_args(entry_type, args, state)) {
                log::warn!("Dropping {:?} trace entry for event {}: {}", entry_type, args.event.id(), err);
            }
            Ok(())
        })?;
    }
    Ok(())
}
