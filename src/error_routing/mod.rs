//! Structured error routing.
//!
//! When an agent fails, the runner asks an [`ErrorRouter`] to turn the
//! failure into a new [`Event`] addressed to an error-handling agent. The
//! event carries an [`ErrorEventData`] record describing what failed, how it
//! was classified, and what the router recommends doing about it.

pub mod classifier;
pub mod recovery;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::events::{
    Event, EventData, RETRY_COUNT_KEY, ROUTE_KEY, SESSION_ID_KEY, STATUS_ERROR, STATUS_KEY,
};

pub use classifier::{Classification, ClassificationRule, ErrorClassifier, KeywordClassifier};
pub use recovery::ErrorRecoveryAgent;

/// Payload key holding the serialized [`ErrorEventData`].
pub const ERROR_DATA_KEY: &str = "error_data";
/// Metadata key naming the agent that failed.
pub const FAILED_AGENT_KEY: &str = "failed_agent_id";

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
    #[serde(rename = "LLM_ERROR")]
    Llm,
    #[serde(rename = "NETWORK_ERROR")]
    Network,
    #[serde(rename = "AUTH_ERROR")]
    Auth,
    #[serde(rename = "RESOURCE_ERROR")]
    Resource,
    #[serde(rename = "UNKNOWN_ERROR")]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Timeout => "TIMEOUT_ERROR",
            Self::Llm => "LLM_ERROR",
            Self::Network => "NETWORK_ERROR",
            Self::Auth => "AUTH_ERROR",
            Self::Resource => "RESOURCE_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Retry,
    Fallback,
    Escalate,
    Terminate,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Fallback => "fallback",
            Self::Escalate => "escalate",
            Self::Terminate => "terminate",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_error_handler_name() -> String {
    "error-handler".to_string()
}

fn default_category_handlers() -> HashMap<ErrorCode, String> {
    [
        (ErrorCode::Validation, "validation-error-handler"),
        (ErrorCode::Timeout, "timeout-error-handler"),
        (ErrorCode::Llm, "llm-error-handler"),
        (ErrorCode::Network, "network-error-handler"),
        (ErrorCode::Auth, "auth-error-handler"),
    ]
    .into_iter()
    .map(|(code, name)| (code, name.to_string()))
    .collect()
}

fn default_severity_handlers() -> HashMap<Severity, String> {
    [
        (Severity::Critical, "critical-error-handler"),
        (Severity::High, "high-priority-error-handler"),
    ]
    .into_iter()
    .map(|(severity, name)| (severity, name.to_string()))
    .collect()
}

/// How failures are classified into recovery actions and handler agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRouterConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub enable_circuit_breaker: bool,
    /// Handler used when no severity or category handler applies.
    #[serde(default = "default_error_handler_name")]
    pub error_handler_name: String,
    #[serde(default = "default_category_handlers")]
    pub category_handlers: HashMap<ErrorCode, String>,
    #[serde(default = "default_severity_handlers")]
    pub severity_handlers: HashMap<Severity, String>,
}

impl Default for ErrorRouterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            enable_circuit_breaker: default_true(),
            error_handler_name: default_error_handler_name(),
            category_handlers: default_category_handlers(),
            severity_handlers: default_severity_handlers(),
        }
    }
}

impl ErrorRouterConfig {
    /// Config that sends every failure to `handler`, with no category or
    /// severity overrides.
    pub fn single_handler(handler: impl Into<String>) -> Self {
        Self {
            error_handler_name: handler.into(),
            category_handlers: HashMap::new(),
            severity_handlers: HashMap::new(),
            ..Self::default()
        }
    }

    /// Every handler name this config can route to.
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::iter::once(self.error_handler_name.clone())
            .chain(self.category_handlers.values().cloned())
            .chain(self.severity_handlers.values().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

// ---------------------------------------------------------------------------
// ErrorEventData
// ---------------------------------------------------------------------------

/// Classification record embedded in every routed error event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEventData {
    pub original_event: Event,
    pub failed_agent_id: String,
    pub error_message: String,
    pub error_code: ErrorCode,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub severity: Severity,
    pub error_category: String,
    pub recovery_action: RecoveryAction,
}

impl ErrorEventData {
    /// Recover the record from an error event's payload.
    pub fn from_event(event: &Event) -> Option<Self> {
        let raw = event.data().get(ERROR_DATA_KEY)?;
        match serde_json::from_value(raw.clone()) {
            Ok(data) => Some(data),
            Err(err) => {
                log::warn!("Event {} has malformed error data: {}", event.id(), err);
                None
            }
        }
    }
}

/// Recovery policy table.
pub fn determine_recovery_action(
    code: ErrorCode,
    retry_count: u32,
    config: &ErrorRouterConfig,
) -> RecoveryAction {
    let can_retry = retry_count < config.max_retries;
    match code {
        ErrorCode::Auth | ErrorCode::Resource => RecoveryAction::Escalate,
        ErrorCode::Validation => RecoveryAction::Terminate,
        ErrorCode::Timeout | ErrorCode::Network | ErrorCode::Llm => {
            if can_retry {
                RecoveryAction::Retry
            } else {
                RecoveryAction::Fallback
            }
        }
        ErrorCode::Unknown => {
            if can_retry {
                RecoveryAction::Retry
            } else {
                RecoveryAction::Escalate
            }
        }
    }
}

/// Severity handler first, then category handler, then the default handler.
pub fn determine_error_handler(data: &ErrorEventData, config: &ErrorRouterConfig) -> String {
    config
        .severity_handlers
        .get(&data.severity)
        .or_else(|| config.category_handlers.get(&data.error_code))
        .filter(|name| !name.is_empty())
        .cloned()
        .unwrap_or_else(|| config.error_handler_name.clone())
}

/// Build the routed error event for `data`, addressed to `handler`.
pub fn build_error_event(data: &ErrorEventData, handler: &str) -> Event {
    let error_data = serde_json::to_value(data).unwrap_or_else(|err| {
        log::error!("Failed to serialize error data: {}", err);
        Value::Null
    });

    let mut payload = EventData::new();
    payload.insert(ERROR_DATA_KEY.to_string(), error_data);
    payload.insert(
        "original_event_id".to_string(),
        json!(data.original_event.id()),
    );
    payload.insert("error".to_string(), json!(data.error_message));
    payload.insert("failed_agent".to_string(), json!(data.failed_agent_id));
    payload.insert("retry_count".to_string(), json!(data.retry_count));
    payload.insert("error_code".to_string(), json!(data.error_code.as_str()));
    payload.insert("severity".to_string(), json!(data.severity.as_str()));
    payload.insert(
        "recovery_action".to_string(),
        json!(data.recovery_action.as_str()),
    );

    let mut metadata = HashMap::new();
    metadata.insert(SESSION_ID_KEY.to_string(), data.session_id.clone());
    metadata.insert(ROUTE_KEY.to_string(), handler.to_string());
    metadata.insert(STATUS_KEY.to_string(), STATUS_ERROR.to_string());
    metadata.insert("error_code".to_string(), data.error_code.as_str().to_string());
    metadata.insert("severity".to_string(), data.severity.as_str().to_string());
    metadata.insert(
        "recovery_action".to_string(),
        data.recovery_action.as_str().to_string(),
    );
    if !data.failed_agent_id.is_empty() && data.failed_agent_id != "unknown" {
        metadata.insert(FAILED_AGENT_KEY.to_string(), data.failed_agent_id.clone());
    }

    let mut event = Event::new(handler, payload, metadata);
    event.set_source_agent_id(data.failed_agent_id.clone());
    event
}

/// Copy of `event` with its retry count bumped by one. The original is untouched.
pub fn increment_retry_count(event: &Event) -> Event {
    let mut metadata = event.metadata_copy();
    metadata.insert(
        RETRY_COUNT_KEY.to_string(),
        (event.retry_count() + 1).to_string(),
    );
    let mut retried = Event::new(event.target_agent_id(), event.data_copy(), metadata);
    retried.set_source_agent_id(event.source_agent_id());
    retried
}

// ---------------------------------------------------------------------------
// ErrorRouter
// ---------------------------------------------------------------------------

/// Turns agent failures into routed error events.
pub trait ErrorRouter: Send + Sync {
    fn create_error_event(&self, original: &Event, agent_id: &str, error: &str) -> Event;

    fn is_retryable(&self, data: &ErrorEventData) -> bool {
        data.recovery_action == RecoveryAction::Retry
    }

    fn increment_retry_count(&self, event: &Event) -> Event {
        increment_retry_count(event)
    }
}

/// Classifying router driven by an [`ErrorRouterConfig`].
pub struct StructuredErrorRouter {
    config: ErrorRouterConfig,
    classifier: Arc<dyn ErrorClassifier>,
}

impl StructuredErrorRouter {
    pub fn new(config: ErrorRouterConfig) -> Self {
        Self {
            config,
            classifier: Arc::new(KeywordClassifier::default()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &ErrorRouterConfig {
        &self.config
    }

    /// Classify a failure without building the event.
    pub fn analyze(&self, original: &Event, agent_id: &str, error: &str) -> ErrorEventData {
        let classification = self.classifier.classify(error);
        let retry_count = original.retry_count();
        let recovery_action =
            determine_recovery_action(classification.code, retry_count, &self.config);

        ErrorEventData {
            original_event: original.clone(),
            failed_agent_id: agent_id.to_string(),
            error_message: error.to_string(),
            error_code: classification.code,
            retry_count,
            timestamp: Utc::now(),
            session_id: original.session_id().to_string(),
            severity: classification.severity,
            error_category: classification.category,
            recovery_action,
        }
    }
}

impl ErrorRouter for StructuredErrorRouter {
    fn create_error_event(&self, original: &Event, agent_id: &str, error: &str) -> Event {
        let data = self.analyze(original, agent_id, error);
        let handler = determine_error_handler(&data, &self.config);
        log::debug!(
            "Routing {} from agent '{}' to '{}' ({})",
            data.error_code,
            agent_id,
            handler,
            data.recovery_action
        );
        build_error_event(&data, &handler)
    }
}

/// Convenience wrapper over [`StructuredErrorRouter`] with the default classifier.
pub fn create_enhanced_error_event(
    original: &Event,
    agent_id: &str,
    error: &str,
    config: &ErrorRouterConfig,
) -> Event {
    StructuredErrorRouter::new(config.clone()).create_error_event(original, agent_id, error)
}

/// Unclassified router: every failure goes to one handler for escalation.
#[derive(Debug, Clone)]
pub struct BasicErrorRouter {
    handler: String,
}

impl BasicErrorRouter {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
        }
    }
}

impl Default for BasicErrorRouter {
    fn default() -> Self {
        Self::new(default_error_handler_name())
    }
}

impl ErrorRouter for BasicErrorRouter {
    fn create_error_event(&self, original: &Event, agent_id: &str, error: &str) -> Event {
        let data = ErrorEventData {
            original_event: original.clone(),
            failed_agent_id: agent_id.to_string(),
            error_message: error.to_string(),
            error_code: ErrorCode::Unknown,
            retry_count: original.retry_count(),
            timestamp: Utc::now(),
            session_id: original.session_id().to_string(),
            severity: Severity::Medium,
            error_category: "unknown".to_string(),
            recovery_action: RecoveryAction::Escalate,
        };
        build_error_event(&data, &self.handler)
    }
}
