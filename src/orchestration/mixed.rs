//! Two-phase dispatch: a collaborative group and a sequential chain.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::{
    seed_state, CollaborativeOrchestrator, MixedOrder, OrchestrationConfig, OrchestrationError,
    OrchestrationMode, Orchestrator, SequentialOrchestrator,
};
use crate::events::Event;
use crate::handler::{AgentHandler, AgentResult};
use crate::hooks::CallbackRegistry;
use crate::state::State;

/// Agents listed in `collaborative_agents` join the fan-out group; agents
/// listed in `sequential_agents` join the chain. The first phase's merged
/// output is the second phase's input. An empty phase is skipped.
pub struct MixedOrchestrator {
    collaborative: CollaborativeOrchestrator,
    sequential: SequentialOrchestrator,
    collaborative_agents: Vec<String>,
    sequential_agents: Vec<String>,
    order: MixedOrder,
    callbacks: Arc<CallbackRegistry>,
}

impl MixedOrchestrator {
    pub fn new(
        callbacks: Arc<CallbackRegistry>,
        collaborative_agents: Vec<String>,
        sequential_agents: Vec<String>,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            collaborative: CollaborativeOrchestrator::new(callbacks.clone(), config),
            sequential: SequentialOrchestrator::new(callbacks.clone(), sequential_agents.clone()),
            collaborative_agents,
            sequential_agents,
            order: MixedOrder::default(),
            callbacks,
        }
    }

    pub fn with_order(mut self, order: MixedOrder) -> Self {
        self.order = order;
        self
    }

    async fn collaborative_phase(
        &self,
        ctx: &CancellationToken,
        event: &Event,
        state: State,
    ) -> Result<AgentResult, OrchestrationError> {
        if self.collaborative.agent_names().is_empty() {
            return Ok(AgentResult::success(state));
        }
        self.collaborative
            .run_group(ctx, event, state)
            .await
            .map_err(|err| OrchestrationError::PhaseFailed {
                phase: "collaborative",
                source: Box::new(err),
            })
    }

    async fn sequential_phase(
        &self,
        ctx: &CancellationToken,
        event: &Event,
        state: State,
    ) -> Result<AgentResult, OrchestrationError> {
        if self.sequential.agent_names().is_empty() {
            return Ok(AgentResult::success(state));
        }
        self.sequential
            .run_chain(ctx, event, state)
            .await
            .map_err(|err| OrchestrationError::PhaseFailed {
                phase: "sequential",
                source: Box::new(err),
            })
    }
}

#[async_trait]
impl Orchestrator for MixedOrchestrator {
    async fn dispatch(
        &self,
        ctx: &CancellationToken,
        event: &Event,
    ) -> Result<AgentResult, OrchestrationError> {
        if self.collaborative.agent_names().is_empty() && self.sequential.agent_names().is_empty() {
            return Err(OrchestrationError::NoAgents {
                mode: OrchestrationMode::Mixed,
            });
        }

        let started = Utc::now();
        let state = seed_state(event);
        let (first, second) = match self.order {
            MixedOrder::CollaborativeFirst => {
                let first = self.collaborative_phase(ctx, event, state).await?;
                let input = first.output_state.clone().unwrap_or_default();
                let second = self.sequential_phase(ctx, event, input).await?;
                (first, second)
            }
            MixedOrder::SequentialFirst => {
                let first = self.sequential_phase(ctx, event, state).await?;
                let input = first.output_state.clone().unwrap_or_default();
                let second = self.collaborative_phase(ctx, event, input).await?;
                (first, second)
            }
        };

        let mut result = AgentResult::success(second.output_state.unwrap_or_default()).timed(started);
        result.outcomes = first.outcomes;
        result.outcomes.extend(second.outcomes);
        Ok(result)
    }

    fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestrationError> {
        let mut placed = false;
        if self.collaborative_agents.iter().any(|a| a == name) {
            self.collaborative.register_agent(name, handler.clone())?;
            placed = true;
        }
        if self.sequential_agents.iter().any(|a| a == name) {
            self.sequential.register_agent(name, handler)?;
            placed = true;
        }
        if !placed {
            if name.trim().is_empty() {
                return Err(OrchestrationError::InvalidAgentName);
            }
            log::warn!(
                "Agent '{}' is in neither the collaborative nor the sequential group; ignoring",
                name
            );
        }
        Ok(())
    }

    fn callback_registry(&self) -> Arc<CallbackRegistry> {
        self.callbacks.clone()
    }

    fn mode(&self) -> OrchestrationMode {
        OrchestrationMode::Mixed
    }

    fn agent_names(&self) -> Vec<String> {
        let mut names = self.collaborative.agent_names();
        for name in self.sequential.agent_names() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    fn stop(&self) {
        self.collaborative.stop();
        self.sequential.stop();
    }
}
