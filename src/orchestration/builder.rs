//! Fluent construction of a ready-to-start [`Runner`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{MixedOrder, OrchestrationConfig, OrchestrationMode, OrchestratorSpec};
use crate::error_routing::ErrorRouterConfig;
use crate::events::ROUTE_KEY;
use crate::factory::ComponentRegistry;
use crate::handler::{handler_fn, AgentHandler, AgentResult};
use crate::resilience::RetryPolicy;
use crate::runner::{Runner, RunnerConfig, RunnerError};

/// Builds a [`Runner`] with an orchestrator and agents already wired up.
///
/// In route mode a default error handler that ends the chain is registered
/// under the configured handler name unless one was supplied.
pub struct OrchestrationBuilder {
    spec: OrchestratorSpec,
    agents: Vec<(String, Arc<dyn AgentHandler>)>,
    runner: RunnerConfig,
    registry: Option<Arc<ComponentRegistry>>,
}

impl OrchestrationBuilder {
    pub fn new(mode: OrchestrationMode) -> Self {
        Self {
            spec: OrchestratorSpec::new(mode),
            agents: Vec::new(),
            runner: RunnerConfig::default(),
            registry: None,
        }
    }

    /// Add an agent. Agents are registered in the order they are added.
    pub fn with_agent(mut self, name: impl Into<String>, handler: Arc<dyn AgentHandler>) -> Self {
        self.agents.push((name.into(), handler));
        self
    }

    pub fn with_agents(
        mut self,
        agents: impl IntoIterator<Item = (String, Arc<dyn AgentHandler>)>,
    ) -> Self {
        self.agents.extend(agents);
        self
    }

    /// Chain order for sequential mode, or the loop agent for loop mode.
    pub fn with_agent_names(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.spec.agent_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_collaborative_agents(
        mut self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.spec.collaborative_agents = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sequential_agents(
        mut self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.spec.sequential_agents = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mixed_order(mut self, order: MixedOrder) -> Self {
        self.spec.mixed_order = order;
        self
    }

    pub fn with_max_iterations(mut self, iterations: u32) -> Self {
        self.spec.max_iterations = iterations;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.spec.config.timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.spec.config.max_concurrency = max;
        self
    }

    /// Share of failed agents (0.0 - 1.0) that aborts a collaborative dispatch.
    pub fn with_failure_threshold(mut self, threshold: f64) -> Self {
        self.spec.config.failure_threshold = threshold;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.spec.config.retry_policy = policy;
        self
    }

    pub fn with_config(mut self, config: OrchestrationConfig) -> Self {
        self.spec.config = config;
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.runner.queue_size = size;
        self
    }

    pub fn with_max_hops(mut self, max_hops: Option<u32>) -> Self {
        self.runner.max_hops = max_hops;
        self
    }

    pub fn with_error_router_config(mut self, config: ErrorRouterConfig) -> Self {
        self.runner.error_router = config;
        self
    }

    pub fn with_registry(mut self, registry: Arc<ComponentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn spec(&self) -> &OrchestratorSpec {
        &self.spec
    }

    pub fn build(self) -> Result<Runner, RunnerError> {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ComponentRegistry::with_defaults()));
        let handler_name = self.runner.error_router.error_handler_name.clone();
        let runner = registry.new_runner(self.runner.clone());
        runner.set_error_router(registry.new_error_router(&self.runner.error_router))?;
        let orchestrator = registry.new_orchestrator(&self.spec, runner.callback_registry());
        runner.set_orchestrator(orchestrator)?;

        let mut supplied_handler = false;
        for (name, handler) in self.agents {
            supplied_handler |= name == handler_name;
            runner.register_agent(&name, handler)?;
        }
        if self.spec.mode == OrchestrationMode::Route && !supplied_handler {
            runner.register_agent(&handler_name, chain_terminator())?;
        }
        log::debug!("Built {} runner", self.spec.mode);
        Ok(runner)
    }
}

/// Handler that clears the route so the chain ends.
fn chain_terminator() -> Arc<dyn AgentHandler> {
    handler_fn(|_ctx, event, mut state| async move {
        log::debug!("Error handler ending chain for event {}", event.id());
        state.set_meta(ROUTE_KEY, "");
        Ok(AgentResult::success(state))
    })
}

// ---------------------------------------------------------------------------
// Presets
// ---------------------------------------------------------------------------

type Agents = HashMap<String, Arc<dyn AgentHandler>>;

/// Agents sorted by name, for deterministic registration order.
fn sorted(agents: Agents) -> Vec<(String, Arc<dyn AgentHandler>)> {
    let mut agents: Vec<_> = agents.into_iter().collect();
    agents.sort_by(|a, b| a.0.cmp(&b.0));
    agents
}

/// Every event goes to all agents at once.
pub fn collaborative_runner(agents: Agents, timeout: Duration) -> Result<Runner, RunnerError> {
    OrchestrationBuilder::new(OrchestrationMode::Collaborate)
        .with_agents(sorted(agents))
        .with_timeout(timeout)
        .build()
}

/// Every event goes to the agent named by its `route`.
pub fn route_runner(agents: Agents) -> Result<Runner, RunnerError> {
    OrchestrationBuilder::new(OrchestrationMode::Route)
        .with_agents(sorted(agents))
        .build()
}

/// Collaborative, wide and tolerant: 50 concurrent agents, 60s budget,
/// aborts only when 80% fail.
pub fn high_throughput_runner(agents: Agents) -> Result<Runner, RunnerError> {
    OrchestrationBuilder::new(OrchestrationMode::Collaborate)
        .with_agents(sorted(agents))
        .with_max_concurrency(50)
        .with_timeout(Duration::from_secs(60))
        .with_failure_threshold(0.8)
        .build()
}

/// Collaborative with a generous retry policy; aborts only when 90% fail.
pub fn fault_tolerant_runner(agents: Agents) -> Result<Runner, RunnerError> {
    OrchestrationBuilder::new(OrchestrationMode::Collaborate)
        .with_agents(sorted(agents))
        .with_retry_policy(RetryPolicy {
            max_retries: 5,
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(30),
            ..RetryPolicy::default()
        })
        .with_failure_threshold(0.9)
        .build()
}

/// Route mode with a concurrency budget for agents that fan out internally.
pub fn load_balanced_runner(agents: Agents, max_concurrency: usize) -> Result<Runner, RunnerError> {
    OrchestrationBuilder::new(OrchestrationMode::Route)
        .with_agents(sorted(agents))
        .with_max_concurrency(max_concurrency)
        .with_timeout(Duration::from_secs(30))
        .build()
}
