//! Explicit component registration.
//!
//! A [`ComponentRegistry`] maps component kinds to constructor closures.
//! [`ComponentRegistry::with_defaults`] registers the full implementations;
//! an empty registry still works, handing out degraded fallbacks (route
//! orchestrator, basic error router, no-op breaker, single-attempt retrier)
//! and logging a warning each time it does.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::RuntimeConfig;
use crate::error_routing::{BasicErrorRouter, ErrorRouter, ErrorRouterConfig, StructuredErrorRouter};
use crate::hooks::CallbackRegistry;
use crate::orchestration::{
    CollaborativeOrchestrator, LoopOrchestrator, MixedOrchestrator, OrchestrationMode,
    Orchestrator, OrchestratorSpec, RouteOrchestrator, SequentialOrchestrator,
};
use crate::resilience::{
    Breaker, CircuitBreaker, CircuitBreakerConfig, NoopBreaker, Retrier, RetryPolicy,
};
use crate::runner::{Runner, RunnerConfig, RunnerError};

pub type OrchestratorFactory =
    Arc<dyn Fn(&OrchestratorSpec, Arc<CallbackRegistry>) -> Arc<dyn Orchestrator> + Send + Sync>;
pub type RunnerFactory = Arc<dyn Fn(RunnerConfig) -> Runner + Send + Sync>;
pub type ErrorRouterFactory = Arc<dyn Fn(&ErrorRouterConfig) -> Arc<dyn ErrorRouter> + Send + Sync>;
pub type CircuitBreakerFactory =
    Arc<dyn Fn(&str, &CircuitBreakerConfig) -> Arc<dyn Breaker> + Send + Sync>;
pub type RetrierFactory = Arc<dyn Fn(&RetryPolicy) -> Retrier + Send + Sync>;

#[derive(Default)]
pub struct ComponentRegistry {
    orchestrators: RwLock<HashMap<OrchestrationMode, OrchestratorFactory>>,
    runner: RwLock<Option<RunnerFactory>>,
    error_router: RwLock<Option<ErrorRouterFactory>>,
    circuit_breaker: RwLock<Option<CircuitBreakerFactory>>,
    retrier: RwLock<Option<RetrierFactory>>,
}

/// The loop agent: first of `agent_names`, else first of `sequential_agents`.
fn loop_agent(spec: &OrchestratorSpec) -> String {
    spec.agent_names
        .first()
        .or_else(|| spec.sequential_agents.first())
        .cloned()
        .unwrap_or_default()
}

/// The chain: `agent_names`, else `sequential_agents`.
fn sequence(spec: &OrchestratorSpec) -> Vec<String> {
    if spec.agent_names.is_empty() {
        spec.sequential_agents.clone()
    } else {
        spec.agent_names.clone()
    }
}

impl ComponentRegistry {
    /// A registry with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in implementation registered.
    pub fn with_defaults() -> Self {
        let registry = Self::new();

        registry.register_orchestrator_factory(OrchestrationMode::Route, |_, callbacks| {
            Arc::new(RouteOrchestrator::new(callbacks))
        });
        registry.register_orchestrator_factory(OrchestrationMode::Collaborate, |spec, callbacks| {
            Arc::new(CollaborativeOrchestrator::new(callbacks, spec.config.clone()))
        });
        registry.register_orchestrator_factory(OrchestrationMode::Parallel, |spec, callbacks| {
            Arc::new(CollaborativeOrchestrator::parallel(callbacks, spec.config.clone()))
        });
        registry.register_orchestrator_factory(OrchestrationMode::Sequential, |spec, callbacks| {
            Arc::new(SequentialOrchestrator::new(callbacks, sequence(spec)))
        });
        registry.register_orchestrator_factory(OrchestrationMode::Loop, |spec, callbacks| {
            Arc::new(LoopOrchestrator::new(
                callbacks,
                loop_agent(spec),
                spec.max_iterations,
            ))
        });
        registry.register_orchestrator_factory(OrchestrationMode::Mixed, |spec, callbacks| {
            Arc::new(
                MixedOrchestrator::new(
                    callbacks,
                    spec.collaborative_agents.clone(),
                    spec.sequential_agents.clone(),
                    spec.config.clone(),
                )
                .with_order(spec.mixed_order),
            )
        });

        registry.register_runner_factory(Runner::new);
        registry.register_error_router_factory(|config| {
            Arc::new(StructuredErrorRouter::new(config.clone()))
        });
        registry.register_circuit_breaker_factory(|name, config| {
            Arc::new(CircuitBreaker::new(name, config.clone()))
        });
        registry.register_retrier_factory(|policy| Retrier::new(policy.clone()));
        registry
    }

    // -- registration -------------------------------------------------------

    pub fn register_orchestrator_factory<F>(&self, mode: OrchestrationMode, factory: F)
    where
        F: Fn(&OrchestratorSpec, Arc<CallbackRegistry>) -> Arc<dyn Orchestrator>
            + Send
            + Sync
            + 'static,
    {
        self.orchestrators.write().insert(mode, Arc::new(factory));
    }

    pub fn register_runner_factory<F>(&self, factory: F)
    where
        F: Fn(RunnerConfig) -> Runner + Send + Sync + 'static,
    {
        *self.runner.write() = Some(Arc::new(factory));
    }

    pub fn register_error_router_factory<F>(&self, factory: F)
    where
        F: Fn(&ErrorRouterConfig) -> Arc<dyn ErrorRouter> + Send + Sync + 'static,
    {
        *self.error_router.write() = Some(Arc::new(factory));
    }

    pub fn register_circuit_breaker_factory<F>(&self, factory: F)
    where
        F: Fn(&str, &CircuitBreakerConfig) -> Arc<dyn Breaker> + Send + Sync + 'static,
    {
        *self.circuit_breaker.write() = Some(Arc::new(factory));
    }

    pub fn register_retrier_factory<F>(&self, factory: F)
    where
        F: Fn(&RetryPolicy) -> Retrier + Send + Sync + 'static,
    {
        *self.retrier.write() = Some(Arc::new(factory));
    }

    // -- construction -------------------------------------------------------

    pub fn new_orchestrator(
        &self,
        spec: &OrchestratorSpec,
        callbacks: Arc<CallbackRegistry>,
    ) -> Arc<dyn Orchestrator> {
        let factory = self.orchestrators.read().get(&spec.mode).cloned();
        match factory {
            Some(factory) => factory(spec, callbacks),
            None => {
                log::warn!(
                    "No orchestrator factory for {} mode; falling back to route",
                    spec.mode
                );
                Arc::new(RouteOrchestrator::new(callbacks))
            }
        }
    }

    pub fn new_runner(&self, config: RunnerConfig) -> Runner {
        let factory = self.runner.read().clone();
        match factory {
            Some(factory) => factory(config),
            None => {
                log::warn!("No runner factory registered; using a plain runner");
                Runner::new(config)
            }
        }
    }

    pub fn new_error_router(&self, config: &ErrorRouterConfig) -> Arc<dyn ErrorRouter> {
        let factory = self.error_router.read().clone();
        match factory {
            Some(factory) => factory(config),
            None => {
                log::warn!("No error router factory registered; using the basic router");
                Arc::new(BasicErrorRouter::new(config.error_handler_name.clone()))
            }
        }
    }

    pub fn new_circuit_breaker(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<dyn Breaker> {
        let factory = self.circuit_breaker.read().clone();
        match factory {
            Some(factory) => factory(name, config),
            None => {
                log::warn!("No circuit breaker factory registered; '{}' will never trip", name);
                Arc::new(NoopBreaker)
            }
        }
    }

    pub fn new_retrier(&self, policy: &RetryPolicy) -> Retrier {
        let factory = self.retrier.read().clone();
        match factory {
            Some(factory) => factory(policy),
            None => {
                log::warn!("No retrier factory registered; operations get a single attempt");
                Retrier::new(RetryPolicy::single_attempt())
            }
        }
    }

    /// Assemble an unstarted runner with its orchestrator and error router.
    /// Agents are registered by the caller.
    pub fn build_runner(&self, config: &RuntimeConfig) -> Result<Runner, RunnerError> {
        let runner = self.new_runner(config.runner_config());
        runner.set_error_router(self.new_error_router(&config.error_routing))?;
        let orchestrator = self.new_orchestrator(&config.orchestration, runner.callback_registry());
        runner.set_orchestrator(orchestrator)?;
        log::info!("Built runner in {} mode", config.orchestration.mode);
        Ok(runner)
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modes: Vec<&'static str> = self
            .orchestrators
            .read()
            .keys()
            .map(|m| m.as_str())
            .collect();
        modes.sort_unstable();
        f.debug_struct("ComponentRegistry")
            .field("orchestrators", &modes)
            .field("runner", &self.runner.read().is_some())
            .field("error_router", &self.error_router.read().is_some())
            .field("circuit_breaker", &self.circuit_breaker.read().is_some())
            .field("retrier", &self.retrier.read().is_some())
            .finish()
    }
}
