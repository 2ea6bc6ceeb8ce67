//! Dispatch strategies.
//!
//! An [`Orchestrator`] receives one event and decides which registered
//! agent handler(s) run for it:
//!
//! | Mode | Strategy |
//! |------|----------|
//! | `route` | the agent named by the event's `route` metadata |
//! | `sequential` | a fixed chain, each output feeding the next input |
//! | `collaborate` / `parallel` | every agent concurrently, outputs merged |
//! | `loop` | one agent repeatedly until it signals completion |
//! | `mixed` | a collaborative phase and a sequential phase |
//!
//! Every variant fires `BeforeAgentRun`, `AfterAgentRun` and `AgentError`
//! callbacks around each agent call. Callback failures are logged and never
//! abort dispatch. Orchestrators do not retry; failures go back to the caller.

pub mod builder;
pub mod collaborative;
pub mod looping;
pub mod mixed;
pub mod route;
pub mod sequential;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, ROUTE_KEY};
use crate::handler::{AgentHandler, AgentOutcome, AgentResult};
use crate::hooks::{CallbackArgs, CallbackRegistry, HookPoint};
use crate::resilience::RetryPolicy;
use crate::state::State;
use crate::utilities::duration_ms;

pub use builder::OrchestrationBuilder;
pub use collaborative::CollaborativeOrchestrator;
pub use looping::{LoopOrchestrator, LOOP_COMPLETED_KEY};
pub use mixed::MixedOrchestrator;
pub use route::{ensure_proper_routing, reconcile_route, RouteOrchestrator};
pub use sequential::SequentialOrchestrator;

// ---------------------------------------------------------------------------
// Modes and configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationMode {
    Route,
    Collaborate,
    Sequential,
    Parallel,
    Loop,
    Mixed,
}

impl OrchestrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Route => "route",
            Self::Collaborate => "collaborate",
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Loop => "loop",
            Self::Mixed => "mixed",
        }
    }
}

impl fmt::Display for OrchestrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrchestrationMode {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "route" => Ok(Self::Route),
            "collaborate" | "collaborative" => Ok(Self::Collaborate),
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "loop" => Ok(Self::Loop),
            "mixed" => Ok(Self::Mixed),
            other => Err(OrchestrationError::UnknownMode(other.to_string())),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_concurrency() -> usize {
    10
}

fn default_failure_threshold() -> f64 {
    0.5
}

/// Limits applied to fan-out dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default = "default_timeout", with = "duration_ms")]
    pub timeout: Duration,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Fraction of failed agents (0.0 - 1.0) at which a collaborative
    /// dispatch gives up on the rest.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_concurrency: default_max_concurrency(),
            failure_threshold: default_failure_threshold(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Order of the two phases of a mixed dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixedOrder {
    #[default]
    CollaborativeFirst,
    SequentialFirst,
}

fn default_mode() -> OrchestrationMode {
    OrchestrationMode::Route
}

fn default_max_iterations() -> u32 {
    5
}

/// Everything needed to construct an orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSpec {
    #[serde(default = "default_mode")]
    pub mode: OrchestrationMode,
    /// Sequence for `sequential`, the agent for `loop`.
    #[serde(default)]
    pub agent_names: Vec<String>,
    #[serde(default)]
    pub collaborative_agents: Vec<String>,
    #[serde(default)]
    pub sequential_agents: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub mixed_order: MixedOrder,
    #[serde(default)]
    pub config: OrchestrationConfig,
}

impl Default for OrchestratorSpec {
    fn default() -> Self {
        Self::new(OrchestrationMode::Route)
    }
}

impl OrchestratorSpec {
    pub fn new(mode: OrchestrationMode) -> Self {
        Self {
            mode,
            agent_names: Vec::new(),
            collaborative_agents: Vec::new(),
            sequential_agents: Vec::new(),
            max_iterations: default_max_iterations(),
            mixed_order: MixedOrder::default(),
            config: OrchestrationConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("missing routing key '{key}' in event metadata (event {event_id})")]
    MissingRoute { key: &'static str, event_id: String },

    #[error("no agent handler registered for target '{target}' (event {event_id})")]
    UnknownAgent { target: String, event_id: String },

    #[error("agent name must not be empty")]
    InvalidAgentName,

    #[error("no agents registered for {mode} dispatch")]
    NoAgents { mode: OrchestrationMode },

    #[error("no agent sequence defined")]
    EmptySequence,

    #[error("no agent specified for loop")]
    NoLoopAgent,

    #[error("loop agent {0} not found")]
    LoopAgentNotFound(String),

    /// The routed agent failed; displays the agent's own message.
    #[error("{source}")]
    AgentFailed {
        agent: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("sequential agent {agent} failed: {source}")]
    StepFailed {
        agent: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("loop agent {agent} (iteration {iteration}) failed: {source}")]
    IterationFailed {
        agent: String,
        iteration: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("collaborative dispatch failed: all agents returned errors")]
    AllAgentsFailed { outcomes: Vec<AgentOutcome> },

    #[error(
        "collaborative dispatch failed: {failed} of {total} agents failed (threshold {threshold})"
    )]
    ThresholdExceeded {
        failed: usize,
        total: usize,
        threshold: f64,
        outcomes: Vec<AgentOutcome>,
    },

    #[error("collaborative dispatch timeout after {0:?}")]
    Timeout(Duration),

    #[error("{phase} phase failed: {source}")]
    PhaseFailed {
        phase: &'static str,
        #[source]
        source: Box<OrchestrationError>,
    },

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("unknown orchestration mode '{0}'")]
    UnknownMode(String),
}

// ---------------------------------------------------------------------------
// Orchestrator trait
// ---------------------------------------------------------------------------

/// Strategy selecting which agent(s) handle an event.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn dispatch(
        &self,
        ctx: &CancellationToken,
        event: &Event,
    ) -> Result<AgentResult, OrchestrationError>;

    fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestrationError>;

    fn callback_registry(&self) -> Arc<CallbackRegistry>;

    fn mode(&self) -> OrchestrationMode;

    /// Registered agent names, in registration order.
    fn agent_names(&self) -> Vec<String>;

    /// Release resources and abandon in-flight fan-out work.
    fn stop(&self) {}
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AgentTable {
    handlers: HashMap<String, Arc<dyn AgentHandler>>,
    order: Vec<String>,
}

/// Name → handler map that remembers registration order.
#[derive(Default)]
pub struct AgentSet {
    inner: RwLock<AgentTable>,
}

impl AgentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`, replacing any handler already under `name`.
    pub fn insert(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestrationError> {
        if name.trim().is_empty() {
            return Err(OrchestrationError::InvalidAgentName);
        }
        let mut table = self.inner.write();
        if table.handlers.insert(name.to_string(), handler).is_some() {
            log::warn!("Overwriting existing handler for agent '{}'", name);
        } else {
            table.order.push(name.to_string());
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentHandler>> {
        self.inner.read().handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    /// All handlers in registration order.
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn AgentHandler>)> {
        let table = self.inner.read();
        table
            .order
            .iter()
            .filter_map(|name| table.handlers.get(name).map(|h| (name.clone(), h.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for AgentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSet")
            .field("agents", &self.names())
            .finish()
    }
}

/// State seeded from an event: its payload plus its metadata, minus the
/// incoming `route` so that only an agent that asks for a route continues
/// the chain.
pub(crate) fn seed_state(event: &Event) -> State {
    let mut state = State::from_data(event.data_copy());
    for (key, value) in event.metadata() {
        if key != ROUTE_KEY {
            state.set_meta(key.clone(), value.clone());
        }
    }
    state
}

/// Run `BeforeAgentRun` callbacks. Failures are logged and the state as
/// last seen by the callbacks is kept.
pub(crate) fn before_agent_run(
    callbacks: &CallbackRegistry,
    event: &Event,
    agent: &str,
    state: State,
) -> State {
    let args = CallbackArgs::new(HookPoint::BeforeAgentRun, event).agent(agent);
    match callbacks.invoke(&args, state) {
        Ok(state) => state,
        Err(failure) => {
            log::warn!(
                "BeforeAgentRun callback failed for agent '{}' (event {}): {}",
                agent,
                event.id(),
                failure
            );
            failure.state
        }
    }
}

/// Invoke `handler` and fire `AfterAgentRun` or `AgentError` callbacks.
///
/// `AfterAgentRun` callbacks may rewrite the output state. Callback failures
/// are logged only.
pub(crate) async fn invoke_agent(
    callbacks: &CallbackRegistry,
    ctx: &CancellationToken,
    event: &Event,
    agent: &str,
    handler: &Arc<dyn AgentHandler>,
    state: State,
) -> anyhow::Result<AgentResult> {
    let started = Utc::now();
    let input = state.clone();
    match handler.run(ctx, event, state).await {
        Ok(result) => {
            let mut result = result.timed(started);
            let output = result.output_state.take().unwrap_or(input);
            let args = CallbackArgs::new(HookPoint::AfterAgentRun, event)
                .agent(agent)
                .result(&result);
            let output = match callbacks.invoke(&args, output) {
                Ok(state) => state,
                Err(failure) => {
                    log::warn!(
                        "AfterAgentRun callback failed for agent '{}' (event {}): {}",
                        agent,
                        event.id(),
                        failure
                    );
                    failure.state
                }
            };
            result.output_state = Some(output);
            Ok(result)
        }
        Err(err) => {
            let message = err.to_string();
            let args = CallbackArgs::new(HookPoint::AgentError, event)
                .agent(agent)
                .error(&message);
            if let Err(failure) = callbacks.invoke(&args, input) {
                log::warn!(
                    "AgentError callback failed for agent '{}' (event {}): {}",
                    agent,
                    event.id(),
                    failure
                );
            }
            Err(err)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Agents shared by the orchestrator tests.

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::*;

    /// Writes `key = value` into the state and optionally requests a route.
    pub struct SetAgent {
        pub key: &'static str,
        pub value: Value,
        pub route: Option<&'static str>,
        pub calls: AtomicU32,
        pub seen: Mutex<Vec<State>>,
    }

    impl SetAgent {
        pub fn new(key: &'static str, value: Value) -> Self {
            Self {
                key,
                value,
                route: None,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn routing_to(mut self, route: &'static str) -> Self {
            self.route = Some(route);
            self
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentHandler for SetAgent {
        async fn run(
            &self,
            _ctx: &CancellationToken,
            _event: &Event,
            mut state: State,
        ) -> anyhow::Result<AgentResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(state.clone());
            state.set(self.key, self.value.clone());
            if let Some(route) = self.route {
                state.set_meta(ROUTE_KEY, route);
            }
            Ok(AgentResult::success(state))
        }
    }

    /// Always fails with the given message, optionally after a delay.
    pub struct FailingAgent {
        pub message: &'static str,
        pub delay: Duration,
        pub calls: AtomicU32,
    }

    impl FailingAgent {
        pub fn new(message: &'static str) -> Self {
            Self {
                message,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AgentHandler for FailingAgent {
        async fn run(
            &self,
            _ctx: &CancellationToken,
            _event: &Event,
            _state: State,
        ) -> anyhow::Result<AgentResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            anyhow::bail!(self.message)
        }
    }

    /// Sleeps before writing its name, honouring cancellation.
    pub struct SlowAgent {
        pub name: &'static str,
        pub delay: Duration,
        pub finished: AtomicU32,
    }

    impl SlowAgent {
        pub fn new(name: &'static str, delay: Duration) -> Self {
            Self {
                name,
                delay,
                finished: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AgentHandler for SlowAgent {
        async fn run(
            &self,
            ctx: &CancellationToken,
            _event: &Event,
            mut state: State,
        ) -> anyhow::Result<AgentResult> {
            tokio::select! {
                _ = ctx.cancelled() => anyhow::bail!("{} cancelled", self.name),
                _ = tokio::time::sleep(self.delay) => {}
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            state.set(self.name, json!(true));
            Ok(AgentResult::success(state))
        }
    }
}
