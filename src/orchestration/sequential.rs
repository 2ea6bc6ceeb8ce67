//! Fixed-order pipeline: each agent's output is the next agent's input.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::{
    before_agent_run, invoke_agent, seed_state, AgentSet, OrchestrationError, OrchestrationMode,
    Orchestrator,
};
use crate::events::Event;
use crate::handler::{AgentHandler, AgentOutcome, AgentResult};
use crate::hooks::CallbackRegistry;
use crate::state::State;

pub struct SequentialOrchestrator {
    agents: AgentSet,
    sequence: Vec<String>,
    callbacks: Arc<CallbackRegistry>,
}

impl SequentialOrchestrator {
    /// An empty `sequence` runs agents in registration order.
    pub fn new(callbacks: Arc<CallbackRegistry>, sequence: Vec<String>) -> Self {
        Self {
            agents: AgentSet::new(),
            sequence,
            callbacks,
        }
    }

    /// The configured order, or registration order when none was given.
    pub fn sequence(&self) -> Vec<String> {
        if self.sequence.is_empty() {
            self.agents.names()
        } else {
            self.sequence.clone()
        }
    }

    /// Run the chain starting from `state`.
    ///
    /// Unregistered steps are skipped, but a sequence in which no step is
    /// registered fails with [`OrchestrationError::UnknownAgent`] naming the
    /// first step.
    pub async fn run_chain(
        &self,
        ctx: &CancellationToken,
        event: &Event,
        state: State,
    ) -> Result<AgentResult, OrchestrationError> {
        let sequence = self.sequence();
        if sequence.is_empty() {
            return Err(OrchestrationError::EmptySequence);
        }

        let started = Utc::now();
        let mut state = state;
        let mut outcomes = Vec::with_capacity(sequence.len());
        for name in &sequence {
            if ctx.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }
            let Some(handler) = self.agents.get(name) else {
                log::warn!("Sequential step '{}' has no registered agent; skipping", name);
                continue;
            };

            log::debug!("Sequential step '{}' for event {}", name, event.id());
            let input = before_agent_run(&self.callbacks, event, name, state.clone());
            match invoke_agent(&self.callbacks, ctx, event, name, &handler, input).await {
                Ok(mut result) => {
                    if let Some(output) = result.output_state.take() {
                        state = output;
                    }
                    result.output_state = Some(state.clone());
                    outcomes.push(AgentOutcome {
                        agent: name.clone(),
                        result: Some(result),
                        error: None,
                    });
                }
                Err(source) => {
                    return Err(OrchestrationError::StepFailed {
                        agent: name.clone(),
                        source,
                    })
                }
            }
        }

        if outcomes.is_empty() {
            return Err(OrchestrationError::UnknownAgent {
                target: sequence[0].clone(),
                event_id: event.id().to_string(),
            });
        }

        let mut result = AgentResult::success(state).timed(started);
        result.outcomes = outcomes;
        Ok(result)
    }
}

#[async_trait]
impl Orchestrator for SequentialOrchestrator {
    async fn dispatch(
        &self,
        ctx: &CancellationToken,
        event: &Event,
    ) -> Result<AgentResult, OrchestrationError> {
        self.run_chain(ctx, event, seed_state(event)).await
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
        OrchestrationMode::Sequential
    }

    fn agent_names(&self) -> Vec<String> {
        self.agents.names()
    }
}
