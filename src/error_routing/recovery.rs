//! Agent that consumes routed error events and acts on their recovery action.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{ErrorEventData, ErrorRouter, RecoveryAction};
use crate::events::{Event, EventEmitter, ROUTE_KEY};
use crate::handler::{AgentHandler, AgentResult};
use crate::resilience::RetryPolicy;
use crate::state::State;

/// Error-handling agent.
///
/// * `retry`: schedules a re-emit of the original event, with its retry count
///   incremented, after the policy's backoff. The wait runs on a spawned task
///   so the runner keeps draining its queue; cancel it with
///   [`ErrorRecoveryAgent::with_shutdown`]. Emit failures after the wait are
///   logged.
/// * `fallback`: re-addresses the original event to the fallback agent, if
///   one is configured.
/// * `escalate` / `terminate`: logs and ends the chain.
///
/// The output state always has an empty route, so the runner never chains
/// from the error handler itself.
pub struct ErrorRecoveryAgent {
    emitter: Arc<dyn EventEmitter>,
    router: Arc<dyn ErrorRouter>,
    policy: RetryPolicy,
    fallback_agent: Option<String>,
    shutdown: CancellationToken,
}

impl ErrorRecoveryAgent {
    pub fn new(
        emitter: Arc<dyn EventEmitter>,
        router: Arc<dyn ErrorRouter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            emitter,
            router,
            policy,
            fallback_agent: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Pending retries are dropped once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_fallback_agent(mut self, agent: impl Into<String>) -> Self {
        self.fallback_agent = Some(agent.into());
        self
    }

    fn schedule_retry(&self, event: Event, delay: Duration) {
        let emitter = self.emitter.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::debug!("Dropping scheduled retry of event {}", event.id());
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            let id = event.id().to_string();
            if let Err(err) = emitter.emit(event).await {
                log::error!("Failed to emit retry of event {}: {}", id, err);
            }
        });
    }

    fn fallback_event(original: &Event, agent: &str) -> Event {
        let mut metadata: HashMap<String, String> = original.metadata_copy();
        metadata.insert(ROUTE_KEY.to_string(), agent.to_string());
        let mut event = Event::new(agent, original.data_copy(), metadata);
        event.set_source_agent_id(original.source_agent_id());
        event
    }
}

#[async_trait]
impl AgentHandler for ErrorRecoveryAgent {
    async fn run(
        &self,
        _ctx: &CancellationToken,
        event: &Event,
        mut state: State,
    ) -> anyhow::Result<AgentResult> {
        state.set_meta(ROUTE_KEY, "");

        let Some(data) = ErrorEventData::from_event(event) else {
            log::warn!("Event {} reached the recovery agent without error data", event.id());
            return Ok(AgentResult::success(state));
        };
        state.set("recovery_action", json!(data.recovery_action.as_str()));

        match data.recovery_action {
            RecoveryAction::Retry if self.router.is_retryable(&data) => {
                let delay = self.policy.calculate_delay(data.retry_count + 1);
                log::info!(
                    "Retrying event {} for agent '{}' in {:?} (attempt {})",
                    data.original_event.id(),
                    data.failed_agent_id,
                    delay,
                    data.retry_count + 1
                );
                let retry = self.router.increment_retry_count(&data.original_event);
                state.set("retried_event_id", json!(retry.id()));
                self.schedule_retry(retry, delay);
            }
            RecoveryAction::Fallback => match &self.fallback_agent {
                Some(agent) => {
                    let fallback = Self::fallback_event(&data.original_event, agent);
                    log::info!(
                        "Falling back from '{}' to '{}' for event {}",
                        data.failed_agent_id,
                        agent,
                        data.original_event.id()
                    );
                    state.set("fallback_event_id", json!(fallback.id()));
                    self.emitter.emit(fallback).await?;
                }
                None => log::warn!(
                    "No fallback agent configured; dropping event {} after {} retries",
                    data.original_event.id(),
                    data.retry_count
                ),
            },
            RecoveryAction::Escalate => log::error!(
                "Escalating {} from agent '{}': {}",
                data.error_code,
                data.failed_agent_id,
                data.error_message
            ),
            RecoveryAction::Terminate | RecoveryAction::Retry => log::warn!(
                "Terminating chain after {} from agent '{}': {}",
                data.error_code,
                data.failed_agent_id,
                data.error_message
            ),
        }

        Ok(AgentResult::success(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_routing::{ErrorRouterConfig, StructuredErrorRouter};
    use crate::events::emitter::testing::RecordingEmitter;
    use crate::events::{EmitError, EventData};

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    fn error_event(message: &str, retry_count: u32) -> Event {
        let mut original = Event::routed("writer", "s1", EventData::new());
        original.set_metadata(crate::events::RETRY_COUNT_KEY, retry_count.to_string());
        StructuredErrorRouter::new(ErrorRouterConfig::default())
            .create_error_event(&original, "writer", message)
    }

    fn agent(emitter: Arc<RecordingEmitter>) -> ErrorRecoveryAgent {
        ErrorRecoveryAgent::new(
            emitter,
            Arc::new(StructuredErrorRouter::new(ErrorRouterConfig::default())),
            quick_policy(),
        )
    }

    async fn wait_for_emits(emitter: &RecordingEmitter, count: usize) -> Vec<Event> {
        for _ in 0..100 {
            let emitted = emitter.emitted();
            if emitted.len() >= count {
                return emitted;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} emitted events", count);
    }

    #[tokio::test]
    async fn test_retry_reemits_with_incremented_count() {
        let emitter = Arc::new(RecordingEmitter::default());
        let recovery = agent(emitter.clone());
        let event = error_event("network glitch", 0);

        let result = recovery
            .run(&CancellationToken::new(), &event, State::new())
            .await
            .unwrap();

        let emitted = wait_for_emits(&emitter, 1).await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].target_agent_id(), "writer");
        assert_eq!(emitted[0].retry_count(), 1);
        let out = result.output_state.unwrap();
        assert_eq!(out.get_meta(ROUTE_KEY), Some(""));
        assert_eq!(out.get("recovery_action"), Some(&json!("retry")));
    }

    #[tokio::test]
    async fn test_fallback_goes_to_configured_agent() {
        let emitter = Arc::new(RecordingEmitter::default());
        let recovery = agent(emitter.clone()).with_fallback_agent("backup-writer");
        let event = error_event("llm refused", 3);

        recovery
            .run(&CancellationToken::new(), &event, State::new())
            .await
            .unwrap();
        let emitted = emitter.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].route(), Some("backup-writer"));
    }

    #[tokio::test]
    async fn test_terminate_emits_nothing() {
        let emitter = Arc::new(RecordingEmitter::default());
        let recovery = agent(emitter.clone());
        let event = error_event("invalid payload", 0);
        recovery
            .run(&CancellationToken::new(), &event, State::new())
            .await
            .unwrap();
        assert!(emitter.emitted().is_empty());
    }

    #[tokio::test]
    async fn test_retry_backoff_does_not_block_the_handler() {
        let emitter = Arc::new(RecordingEmitter::default());
        let recovery = ErrorRecoveryAgent::new(
            emitter.clone(),
            Arc::new(StructuredErrorRouter::new(ErrorRouterConfig::default())),
            RetryPolicy {
                initial_delay: Duration::from_millis(80),
                max_delay: Duration::from_millis(80),
                jitter: false,
                ..RetryPolicy::default()
            },
        );
        let event = error_event("network glitch", 0);

        let result = tokio::time::timeout(
            Duration::from_millis(40),
            recovery.run(&CancellationToken::new(), &event, State::new()),
        )
        .await
        .expect("handler waited for the backoff")
        .unwrap();
        assert!(result.is_success());
        assert!(emitter.emitted().is_empty());

        let emitted = wait_for_emits(&emitter, 1).await;
        assert_eq!(emitted[0].retry_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_retry() {
        let emitter = Arc::new(RecordingEmitter::default());
        let shutdown = CancellationToken::new();
        let recovery = ErrorRecoveryAgent::new(
            emitter.clone(),
            Arc::new(StructuredErrorRouter::new(ErrorRouterConfig::default())),
            RetryPolicy {
                initial_delay: Duration::from_millis(30),
                jitter: false,
                ..RetryPolicy::default()
            },
        )
        .with_shutdown(shutdown.clone());

        recovery
            .run(&CancellationToken::new(), &error_event("network glitch", 0), State::new())
            .await
            .unwrap();
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(emitter.emitted().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_emit_failure_is_reported() {
        let emitter = Arc::new(RecordingEmitter::failing(EmitError::QueueFull));
        let recovery = agent(emitter).with_fallback_agent("backup-writer");
        let event = error_event("llm refused", 3);
        let err = recovery
            .run(&CancellationToken::new(), &event, State::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("queue full"));
    }

    #[tokio::test]
    async fn test_plain_event_is_ignored() {
        let emitter = Arc::new(RecordingEmitter::default());
        let recovery = agent(emitter.clone());
        let event = Event::routed("error-handler", "s", EventData::new());
        let result = recovery
            .run(&CancellationToken::new(), &event, State::new())
            .await
            .unwrap();
        assert!(result.is_success());
        assert!(emitter.emitted().is_empty());
    }
}
