//! # Switchyard
//!
//! An event-driven runtime for multi-agent workflows.
//!
//! Events are queued on a [`Runner`], which hands each one to an
//! [`Orchestrator`]. The orchestrator picks which registered agents run
//! (by route, in sequence, all at once, in a loop, or a mix of those) and the
//! runner chains the result onward, routes failures to error-handler agents
//! and records a trace of what happened.
//!
//! Around that core sit the pieces agents use for their own downstream calls:
//! circuit breakers and retry with backoff ([`resilience`]), error
//! classification ([`error_routing`]), capability traits for models and
//! memory ([`capabilities`]) and static workflow checks ([`validation`]).

pub mod capabilities;
pub mod config;
pub mod error_routing;
pub mod events;
pub mod factory;
pub mod handler;
pub mod hooks;
pub mod orchestration;
pub mod resilience;
pub mod runner;
pub mod state;
pub mod utilities;
pub mod validation;

pub use capabilities::{AgentCapabilities, Capability, CapabilityError, Memory, ModelProvider};
pub use config::{ConfigError, RuntimeConfig};
pub use error_routing::{ErrorRouter, ErrorRouterConfig, StructuredErrorRouter};
pub use events::{EmitError, Event, EventData, EventEmitter};
pub use factory::ComponentRegistry;
pub use handler::{handler_fn, AgentHandler, AgentResult};
pub use hooks::{CallbackRegistry, HookPoint};
pub use orchestration::{
    OrchestrationBuilder, OrchestrationError, OrchestrationMode, Orchestrator, OrchestratorSpec,
};
pub use resilience::{CircuitBreaker, Retrier, RetryPolicy};
pub use runner::{InMemoryTraceLogger, Runner, RunnerConfig, RunnerError, TraceLogger};
pub use state::State;
pub use validation::{ErrorRoutingValidator, WorkflowValidator};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
