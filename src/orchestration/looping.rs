//! Repeat a single agent until it reports completion.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{
    before_agent_run, invoke_agent, seed_state, AgentSet, OrchestrationError, OrchestrationMode,
    Orchestrator,
};
use crate::events::Event;
use crate::handler::{AgentHandler, AgentOutcome, AgentResult};
use crate::hooks::CallbackRegistry;

/// Data key an agent sets to `true` to end the loop early.
pub const LOOP_COMPLETED_KEY: &str = "loop_completed";

const DEFAULT_MAX_ITERATIONS: u32 = 5;

pub struct LoopOrchestrator {
    agents: AgentSet,
    agent_name: String,
    max_iterations: u32,
    callbacks: Arc<CallbackRegistry>,
}

impl LoopOrchestrator {
    /// `max_iterations` of zero means the default of five.
    pub fn new(
        callbacks: Arc<CallbackRegistry>,
        agent_name: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        Self {
            agents: AgentSet::new(),
            agent_name: agent_name.into(),
            max_iterations: if max_iterations == 0 {
                DEFAULT_MAX_ITERATIONS
            } else {
                max_iterations
            },
            callbacks,
        }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }
}

#[async_trait]
impl Orchestrator for LoopOrchestrator {
    async fn dispatch(
        &self,
        ctx: &CancellationToken,
        event: &Event,
    ) -> Result<AgentResult, OrchestrationError> {
        if self.agent_name.is_empty() {
            return Err(OrchestrationError::NoLoopAgent);
        }
        let handler = self
            .agents
            .get(&self.agent_name)
            .ok_or_else(|| OrchestrationError::LoopAgentNotFound(self.agent_name.clone()))?;

        let started = Utc::now();
        let name = self.agent_name.as_str();
        let mut state = seed_state(event);
        let mut outcomes = Vec::new();
        for iteration in 1..=self.max_iterations {
            if ctx.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }
            log::debug!(
                "Loop agent '{}' iteration {}/{}",
                name,
                iteration,
                self.max_iterations
            );

            let input = before_agent_run(&self.callbacks, event, name, state.clone());
            let mut result = invoke_agent(&self.callbacks, ctx, event, name, &handler, input)
                .await
                .map_err(|source| OrchestrationError::IterationFailed {
                    agent: name.to_string(),
                    iteration,
                    source,
                })?;
            if let Some(output) = result.output_state.take() {
                state = output;
            }
            result.output_state = Some(state.clone());
            outcomes.push(AgentOutcome {
                agent: name.to_string(),
                result: Some(result),
                error: None,
            });

            if state.get(LOOP_COMPLETED_KEY) == Some(&Value::Bool(true)) {
                log::info!("Loop agent '{}' signalled completion at iteration {}", name, iteration);
                break;
            }
        }

        let mut result = AgentResult::success(state).timed(started);
        result.outcomes = outcomes;
        Ok(result)
    }

    fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestrationError> {
        self.agents.insert(name, handler)
    }

    fn callback_registry(&self) -> Arc<CallbackRegistry> {
        self.callbacks.clone()
    }

    fn mode(&self) -> OrchestrationMode {
        OrchestrationMode::Loop
    }

    fn agent_names(&self) -> Vec<String> {
        self.agents.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventData;
    use crate::handler::handler_fn;
    use crate::orchestration::testing::FailingAgent;
    use serde_json::json;

    fn counter(done_at: Option<i64>) -> Arc<dyn AgentHandler> {
        handler_fn(move |_ctx, _event, mut state| async move {
            let n = state.get("count").and_then(Value::as_i64).unwrap_or(0) + 1;
            state.set("count", json!(n));
            if Some(n) == done_at {
                state.set(LOOP_COMPLETED_KEY, json!(true));
            }
            Ok(AgentResult::success(state))
        })
    }

    fn event() -> Event {
        Event::routed("refiner", "s1", EventData::new())
    }

    #[tokio::test]
    async fn test_stops_on_completion_flag() {
        let orch = LoopOrchestrator::new(Arc::new(CallbackRegistry::new()), "refiner", 10);
        orch.register_agent("refiner", counter(Some(3))).unwrap();
        let result = orch.dispatch(&CancellationToken::new(), &event()).await.unwrap();
        assert_eq!(result.output_state.unwrap().get("count"), Some(&json!(3)));
        assert_eq!(result.outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_runs_to_max_iterations() {
        let orch = LoopOrchestrator::new(Arc::new(CallbackRegistry::new()), "refiner", 0);
        assert_eq!(orch.max_iterations(), 5);
        orch.register_agent("refiner", counter(None)).unwrap();
        let result = orch.dispatch(&CancellationToken::new(), &event()).await.unwrap();
        assert_eq!(result.output_state.unwrap().get("count"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_string_true_is_not_completion() {
        let orch = LoopOrchestrator::new(Arc::new(CallbackRegistry::new()), "refiner", 2);
        orch.register_agent(
            "refiner",
            handler_fn(|_ctx, _event, mut state| async move {
                state.set(LOOP_COMPLETED_KEY, json!("true"));
                Ok(AgentResult::success(state))
            }),
        )
        .unwrap();
        let result = orch.dispatch(&CancellationToken::new(), &event()).await.unwrap();
        assert_eq!(result.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_errors() {
        let unnamed = LoopOrchestrator::new(Arc::new(CallbackRegistry::new()), "", 3);
        let err = unnamed
            .dispatch(&CancellationToken::new(), &event())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no agent specified for loop");

        let orch = LoopOrchestrator::new(Arc::new(CallbackRegistry::new()), "refiner", 3);
        let err = orch
            .dispatch(&CancellationToken::new(), &event())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "loop agent refiner not found");

        orch.register_agent("refiner", Arc::new(FailingAgent::new("stuck")))
            .unwrap();
        let err = orch
            .dispatch(&CancellationToken::new(), &event())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "loop agent refiner (iteration 1) failed: stuck");
    }
}
