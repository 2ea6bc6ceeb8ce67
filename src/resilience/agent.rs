//! Agent decorator that retries its inner handler behind an optional breaker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::Breaker;
use super::retry::Retrier;
use crate::events::Event;
use crate::handler::{AgentHandler, AgentResult};
use crate::state::State;

/// Wraps an [`AgentHandler`] with a [`Retrier`] and, optionally, a [`Breaker`].
///
/// Each attempt receives a fresh clone of the input state, so a failed
/// attempt's partial mutations never leak into the next one.
pub struct ResilientAgent {
    name: String,
    inner: Arc<dyn AgentHandler>,
    retrier: Retrier,
    breaker: Option<Arc<dyn Breaker>>,
}

impl ResilientAgent {
    pub fn new(name: impl Into<String>, inner: Arc<dyn AgentHandler>, retrier: Retrier) -> Self {
        Self {
            name: name.into(),
            inner,
            retrier,
            breaker: None,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<dyn Breaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }
}

#[async_trait]
impl AgentHandler for ResilientAgent {
    async fn run(
        &self,
        ctx: &CancellationToken,
        event: &Event,
        state: State,
    ) -> anyhow::Result<AgentResult> {
        let attempt = || {
            let inner = self.inner.clone();
            let ctx = ctx.clone();
            let event = event.clone();
            let state = state.clone();
            async move { inner.run(&ctx, &event, state).await }
        };

        let outcome = match &self.breaker {
            Some(breaker) => {
                self.retrier
                    .execute_with_circuit_breaker(ctx, breaker.as_ref(), attempt)
                    .await
            }
            None => self.retrier.execute(ctx, attempt).await,
        };

        if outcome.success && outcome.attempts > 1 {
            log::info!(
                "Agent '{}' succeeded after {} attempts",
                self.name,
                outcome.attempts
            );
        } else if !outcome.success {
            log::warn!(
                "Agent '{}' failed after {} attempts: {}",
                self.name,
                outcome.attempts,
                outcome.last_error.as_deref().unwrap_or("unknown error")
            );
        }
        outcome.into_result()
    }
}
