//! The agent seam: what orchestrators invoke and what agents hand back.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::events::Event;
use crate::state::State;
use crate::utilities::duration_ms;

// ---------------------------------------------------------------------------
// AgentHandler
// ---------------------------------------------------------------------------

/// A pluggable unit of work.
///
/// `state` is owned by the handler for the duration of the call; return it
/// (possibly modified) as [`AgentResult::output_state`]. Setting the `route`
/// metadata key on the output asks the runner to continue the chain at that
/// agent.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn run(
        &self,
        ctx: &CancellationToken,
        event: &Event,
        state: State,
    ) -> anyhow::Result<AgentResult>;
}

struct FnHandler<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> AgentHandler for FnHandler<F, Fut>
where
    F: Fn(CancellationToken, Event, State) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<AgentResult>> + Send,
{
    async fn run(
        &self,
        ctx: &CancellationToken,
        event: &Event,
        state: State,
    ) -> anyhow::Result<AgentResult> {
        (self.f)(ctx.clone(), event.clone(), state).await
    }
}

/// Wrap an async closure as an [`AgentHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn AgentHandler>
where
    F: Fn(CancellationToken, Event, State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<AgentResult>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _future: PhantomData,
    })
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub output_state: Option<State>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    /// Per-agent results for dispatches that fan out, in registration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<AgentOutcome>,
    /// Set by the route orchestrator when the output asked for a new route.
    #[serde(skip)]
    pub route_change: Option<RouteChange>,
}

impl AgentResult {
    pub fn success(state: State) -> Self {
        let now = Utc::now();
        Self {
            output_state: Some(state),
            error: None,
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
            outcomes: Vec::new(),
            route_change: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            output_state: None,
            error: Some(message.into()),
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
            outcomes: Vec::new(),
            route_change: None,
        }
    }

    /// Stamp the result as having run from `start` until now.
    pub fn timed(mut self, start: DateTime<Utc>) -> Self {
        let end = Utc::now();
        self.start_time = start;
        self.end_time = end;
        self.duration = (end - start).to_std().unwrap_or_default();
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Non-empty route requested by the output state.
    pub fn next_route(&self) -> Option<&str> {
        self.output_state
            .as_ref()
            .and_then(|s| s.get_meta(crate::events::ROUTE_KEY))
            .filter(|r| !r.is_empty())
    }
}

/// One agent's contribution to a fan-out dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AgentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A continuation produced by route reconciliation.
#[derive(Debug, Clone)]
pub struct RouteChange {
    /// The event that continues the chain at the new route.
    pub event: Event,
    /// Whether the orchestrator's own emitter accepted the event.
    pub emitted: bool,
    /// Why emission failed, when it was attempted.
    pub emit_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventData, ROUTE_KEY};
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_fn_runs_closure() {
        let handler = handler_fn(|_ctx, event, mut state| async move {
            state.set("seen", json!(event.id()));
            Ok(AgentResult::success(state))
        });
        let event = Event::routed("a", "s", EventData::new());
        let result = handler
            .run(&CancellationToken::new(), &event, State::new())
            .await
            .unwrap();
        let out = result.output_state.unwrap();
        assert_eq!(out.get("seen"), Some(&json!(event.id())));
    }

    #[test]
    fn test_next_route_ignores_empty() {
        let mut state = State::new();
        state.set_meta(ROUTE_KEY, "");
        assert_eq!(AgentResult::success(state.clone()).next_route(), None);
        state.set_meta(ROUTE_KEY, "editor");
        assert_eq!(AgentResult::success(state).next_route(), Some("editor"));
    }

    #[test]
    fn test_serialized_duration_is_millis() {
        let mut result = AgentResult::success(State::new());
        result.duration = Duration::from_millis(42);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["duration_ms"], 42);
        assert!(value.get("error").is_none());
    }
}
