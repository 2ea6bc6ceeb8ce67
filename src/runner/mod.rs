//! The event loop.
//!
//! A [`Runner`] owns a bounded queue of [`Event`]s and a single task that
//! drains it in FIFO order. Per event the loop:
//!
//! 1. fills in a missing `session_id` from the event ID,
//! 2. runs `BeforeEventHandling` callbacks (a failure drops the event),
//! 3. resolves the target (`route`, then target field, then `"unknown"`),
//! 4. runs `BeforeAgentRun` callbacks (a failure counts as an agent error),
//! 5. hands the event to the orchestrator,
//! 6. on failure runs `AgentError` callbacks and emits a routed error event,
//! 7. on success emits a follow-up event when the output requests a route,
//! 8. runs `AfterEventHandling` callbacks.
//!
//! Every event the runner synthesizes carries a `hops_remaining` budget so
//! that agents routing to each other, or an error handler that keeps
//! failing, cannot keep the queue busy forever.

pub mod trace;

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error_routing::{ErrorRouter, ErrorRouterConfig, StructuredErrorRouter};
use crate::events::{
    EmitError, Event, EventData, EventEmitter, HOPS_REMAINING_KEY, SESSION_ID_KEY, STATUS_KEY,
    STATUS_SUCCESS,
};
use crate::handler::{AgentHandler, AgentResult};
use crate::hooks::{CallbackArgs, CallbackRegistry, HookPoint, RegistryError};
use crate::orchestration::{OrchestrationError, Orchestrator};
use crate::state::State;
use crate::utilities::duration_ms;

pub use trace::{
    register_trace_hooks, InMemoryTraceLogger, NoopTraceLogger, TraceEntry, TraceEntryType,
    TraceError, TraceLogger, DEFAULT_SESSION,
};

// ---------------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------------

fn default_queue_size() -> usize {
    100
}

fn default_emit_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_max_hops() -> Option<u32> {
    Some(32)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Queue capacity. Zero means the default.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// How long `emit` waits for queue space.
    #[serde(default = "default_emit_timeout", with = "duration_ms")]
    pub emit_timeout: Duration,
    /// Hop budget for runner-synthesized events; `None` disables the ceiling.
    #[serde(default = "default_max_hops")]
    pub max_hops: Option<u32>,
    #[serde(default)]
    pub error_router: ErrorRouterConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            emit_timeout: default_emit_timeout(),
            max_hops: default_max_hops(),
            error_router: ErrorRouterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Unstarted,
    Running,
    Stopped,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Emit(#[from] EmitError),

    #[error("runner already started")]
    AlreadyStarted,

    #[error("orchestrator must be set before starting runner")]
    NoOrchestrator,

    #[error("trace logger is not set")]
    TraceLoggerNotSet,

    #[error("hop limit reached; not emitting follow-up of event {event_id}")]
    HopLimitExceeded { event_id: String },

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Trace(#[from] TraceError),
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

struct Lifecycle {
    state: RunnerState,
    run_token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct RunnerInner {
    config: RunnerConfig,
    callbacks: Arc<CallbackRegistry>,
    orchestrator: RwLock<Option<Arc<dyn Orchestrator>>>,
    trace_logger: RwLock<Option<Arc<dyn TraceLogger>>>,
    error_router: RwLock<Arc<dyn ErrorRouter>>,
    sender: mpsc::Sender<Event>,
    receiver: Mutex<Option<mpsc::Receiver<Event>>>,
    lifecycle: Mutex<Lifecycle>,
}

/// Event loop handle. Clones share the same queue and lifecycle.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_callbacks(config, Arc::new(CallbackRegistry::new()))
    }

    /// A runner sharing an existing callback registry.
    pub fn with_callbacks(mut config: RunnerConfig, callbacks: Arc<CallbackRegistry>) -> Self {
        if config.queue_size == 0 {
            config.queue_size = default_queue_size();
        }
        let (sender, receiver) = mpsc::channel(config.queue_size);
        let error_router: Arc<dyn ErrorRouter> =
            Arc::new(StructuredErrorRouter::new(config.error_router.clone()));
        Self {
            inner: Arc::new(RunnerInner {
                config,
                callbacks,
                orchestrator: RwLock::new(None),
                trace_logger: RwLock::new(None),
                error_router: RwLock::new(error_router),
                sender,
                receiver: Mutex::new(Some(receiver)),
                lifecycle: Mutex::new(Lifecycle {
                    state: RunnerState::Unstarted,
                    run_token: None,
                    task: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> RunnerState {
        let lifecycle = self.inner.lifecycle.lock();
        match (&lifecycle.state, &lifecycle.run_token) {
            (RunnerState::Running, Some(token)) if token.is_cancelled() => RunnerState::Stopped,
            (state, _) => *state,
        }
    }

    fn ensure_not_running(&self) -> Result<(), RunnerError> {
        match self.inner.lifecycle.lock().state {
            RunnerState::Unstarted => Ok(()),
            _ => Err(RunnerError::AlreadyStarted),
        }
    }

    pub fn set_orchestrator(&self, orchestrator: Arc<dyn Orchestrator>) -> Result<(), RunnerError> {
        self.ensure_not_running()?;
        log::debug!("Runner orchestrator set to {} mode", orchestrator.mode());
        *self.inner.orchestrator.write() = Some(orchestrator);
        Ok(())
    }

    pub fn orchestrator(&self) -> Option<Arc<dyn Orchestrator>> {
        self.inner.orchestrator.read().clone()
    }

    /// Install a trace logger and register its callbacks.
    pub fn set_trace_logger(&self, logger: Arc<dyn TraceLogger>) -> Result<(), RunnerError> {
        self.ensure_not_running()?;
        register_trace_hooks(&self.inner.callbacks, logger.clone())?;
        *self.inner.trace_logger.write() = Some(logger);
        Ok(())
    }

    pub fn trace_logger(&self) -> Option<Arc<dyn TraceLogger>> {
        self.inner.trace_logger.read().clone()
    }

    pub fn set_error_router(&self, router: Arc<dyn ErrorRouter>) -> Result<(), RunnerError> {
        self.ensure_not_running()?;
        *self.inner.error_router.write() = router;
        Ok(())
    }

    pub fn error_router(&self) -> Arc<dyn ErrorRouter> {
        self.inner.error_router.read().clone()
    }

    pub fn callback_registry(&self) -> Arc<CallbackRegistry> {
        self.inner.callbacks.clone()
    }

    pub fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), RunnerError> {
        let orchestrator = self.orchestrator().ok_or(RunnerError::NoOrchestrator)?;
        orchestrator.register_agent(name, handler)?;
        log::debug!("Registered agent '{}'", name);
        Ok(())
    }

    pub fn register_callback<F>(
        &self,
        hook: HookPoint,
        name: impl Into<String>,
        callback: F,
    ) -> Result<(), RunnerError>
    where
        F: Fn(&CallbackArgs<'_>, &mut State) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.callbacks.register(hook, name, callback)?;
        Ok(())
    }

    pub fn unregister_callback(&self, hook: HookPoint, name: &str) {
        self.inner.callbacks.unregister(hook, name);
    }

    pub fn dump_trace(&self, session_id: &str) -> Result<Vec<TraceEntry>, RunnerError> {
        let logger = self.trace_logger().ok_or(RunnerError::TraceLoggerNotSet)?;
        Ok(logger.get_trace(session_id)?)
    }

    /// A handle that emits onto this runner's queue without keeping it alive.
    ///
    /// Events queued through the handle spend one hop of the budget they
    /// carry, the same as follow-ups the runner emits itself.
    pub fn emitter(&self) -> Arc<dyn EventEmitter> {
        Arc::new(RunnerEmitter {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Queue an event, waiting up to `emit_timeout` for space.
    pub async fn emit(&self, event: Event) -> Result<(), RunnerError> {
        Ok(self.inner.emit(event).await?)
    }

    /// Spawn the event loop. The loop also stops when `ctx` is cancelled.
    pub fn start(&self, ctx: &CancellationToken) -> Result<(), RunnerError> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state != RunnerState::Unstarted {
            return Err(RunnerError::AlreadyStarted);
        }
        if self.inner.orchestrator.read().is_none() {
            return Err(RunnerError::NoOrchestrator);
        }
        let receiver = self
            .inner
            .receiver
            .lock()
            .take()
            .ok_or(RunnerError::AlreadyStarted)?;

        let run_token = ctx.child_token();
        let task = tokio::spawn(run_loop(self.inner.clone(), receiver, run_token.clone()));
        lifecycle.state = RunnerState::Running;
        lifecycle.run_token = Some(run_token);
        lifecycle.task = Some(task);
        log::info!("Runner started (queue size {})", self.inner.config.queue_size);
        Ok(())
    }

    /// Stop the loop and wait for it to finish. Idempotent; a no-op on a
    /// runner that was never started. A stopped runner cannot be restarted.
    pub async fn stop(&self) {
        let (token, task) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.state != RunnerState::Running {
                return;
            }
            lifecycle.state = RunnerState::Stopped;
            (lifecycle.run_token.clone(), lifecycle.task.take())
        };
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(task) = task {
            if let Err(err) = task.await {
                log::error!("Runner loop ended abnormally: {}", err);
            }
        }
        if let Some(orchestrator) = self.orchestrator() {
            orchestrator.stop();
        }
        log::info!("Runner stopped");
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("state", &self.state())
            .field("queue_size", &self.inner.config.queue_size)
            .field(
                "agents",
                &self.orchestrator().map(|o| o.agent_names()).unwrap_or_default(),
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Emitter handle
// ---------------------------------------------------------------------------

struct RunnerEmitter {
    inner: Weak<RunnerInner>,
}

#[async_trait]
impl EventEmitter for RunnerEmitter {
    async fn emit(&self, mut event: Event) -> Result<(), EmitError> {
        let inner = self.inner.upgrade().ok_or(EmitError::Detached)?;
        match inner.next_hops(&event) {
            Ok(Some(remaining)) => event.set_metadata(HOPS_REMAINING_KEY, remaining.to_string()),
            Ok(None) => {}
            Err(_) => {
                log::error!("Hop limit reached; refusing to queue event {}", event.id());
                return Err(EmitError::HopLimitReached {
                    event_id: event.id().to_string(),
                });
            }
        }
        inner.emit(event).await
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

async fn run_loop(
    inner: Arc<RunnerInner>,
    mut receiver: mpsc::Receiver<Event>,
    token: CancellationToken,
) {
    log::debug!("Runner loop started");
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = receiver.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };
        let span = tracing::debug_span!(
            "event",
            event_id = %event.id(),
            session_id = %event.session_id()
        );
        inner.process(event, &token).instrument(span).await;
    }
    log::debug!("Runner loop exiting");
}

impl RunnerInner {
    async fn emit(&self, event: Event) -> Result<(), EmitError> {
        let token = {
            let lifecycle = self.lifecycle.lock();
            match (&lifecycle.state, &lifecycle.run_token) {
                (RunnerState::Running, Some(token)) if !token.is_cancelled() => token.clone(),
                _ => return Err(EmitError::NotRunning),
            }
        };
        tokio::select! {
            _ = token.cancelled() => Err(EmitError::StoppedWhileEmitting),
            sent = tokio::time::timeout(self.config.emit_timeout, self.sender.send(event)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(EmitError::NotRunning),
                Err(_) => Err(EmitError::QueueFull),
            },
        }
    }

    async fn process(&self, mut event: Event, run_token: &CancellationToken) {
        if event.session_id().is_empty() {
            let session = event.id().to_string();
            log::warn!("Event {} has no session ID; using the event ID", session);
            event.set_metadata(SESSION_ID_KEY, session);
        }
        let event_token = run_token.child_token();
        let _guard = event_token.clone().drop_guard();
        log::debug!("Processing event {}", event.id());

        let before = CallbackArgs::new(HookPoint::BeforeEventHandling, &event);
        let mut state = match self.callbacks.invoke(&before, State::new()) {
            Ok(state) => state,
            Err(failure) => {
                log::error!("Dropping event {}: {}", event.id(), failure);
                return;
            }
        };

        let Some(orchestrator) = self.orchestrator.read().clone() else {
            log::error!("No orchestrator configured; dropping event {}", event.id());
            return;
        };
        let target = event
            .route()
            .or_else(|| Some(event.target_agent_id()).filter(|t| !t.is_empty()))
            .unwrap_or("unknown")
            .to_string();

        let args = CallbackArgs::new(HookPoint::BeforeAgentRun, &event).agent(&target);
        let outcome: Result<AgentResult, String> = match self.callbacks.invoke(&args, state.clone())
        {
            Err(failure) => {
                state = failure.state.clone();
                Err(format!("BeforeAgentRun callback failed: {}", failure))
            }
            Ok(next) => {
                state = next;
                orchestrator
                    .dispatch(&event_token, &event)
                    .await
                    .map_err(|err| err.to_string())
            }
        };

        match &outcome {
            Err(message) => {
                log::error!("Agent '{}' failed on event {}: {}", target, event.id(), message);
                let args = CallbackArgs::new(HookPoint::AgentError, &event)
                    .agent(&target)
                    .error(message);
                match self.callbacks.invoke(&args, state.clone()) {
                    Ok(next) => state = next,
                    Err(failure) => {
                        log::error!("AgentError callbacks failed: {}", failure);
                        state = failure.state;
                    }
                }
                let router = self.error_router.read().clone();
                let error_event = router.create_error_event(&event, &target, message);
                self.forward(&event, error_event).await;
            }
            Ok(result) => self.chain(&event, &target, result).await,
        }

        let final_state = match &outcome {
            Ok(result) => result.output_state.clone().unwrap_or(state),
            Err(_) => state,
        };
        let mut after = CallbackArgs::new(HookPoint::AfterEventHandling, &event).agent(&target);
        if let Ok(result) = &outcome {
            after = after.result(result);
        }
        if let Err(message) = &outcome {
            after = after.error(message);
        }
        if let Err(failure) = self.callbacks.invoke(&after, final_state) {
            log::error!("AfterEventHandling callbacks failed: {}", failure);
        }
    }

    /// Emit the follow-up for a successful dispatch, unless the orchestrator
    /// already emitted it.
    async fn chain(&self, event: &Event, agent: &str, result: &AgentResult) {
        if result.route_change.as_ref().is_some_and(|change| change.emitted) {
            log::debug!("Route change for event {} already emitted", event.id());
            return;
        }
        let Some(route) = result.next_route() else {
            log::debug!("No route in output of event {}; chain ends", event.id());
            return;
        };
        let Some(output) = result.output_state.as_ref() else {
            return;
        };

        let payload: EventData = output.data().clone();
        let mut metadata = output.metadata().clone();
        metadata.insert(SESSION_ID_KEY.to_string(), event.session_id().to_string());
        metadata.insert(STATUS_KEY.to_string(), STATUS_SUCCESS.to_string());
        let mut follow_up = Event::new(route, payload, metadata);
        follow_up.set_source_agent_id(agent);
        self.forward(event, follow_up).await;
    }

    /// Stamp the hop budget on a synthesized event and queue it.
    async fn forward(&self, parent: &Event, mut event: Event) {
        match self.next_hops(parent) {
            Ok(Some(remaining)) => event.set_metadata(HOPS_REMAINING_KEY, remaining.to_string()),
            Ok(None) => {}
            Err(err) => {
                log::error!("{}", err);
                return;
            }
        }
        let id = event.id().to_string();
        if let Err(err) = self.emit(event).await {
            log::error!("Failed to emit event {} (from {}): {}", id, parent.id(), err);
        }
    }

    fn next_hops(&self, parent: &Event) -> Result<Option<u32>, RunnerError> {
        let Some(max) = self.config.max_hops else {
            return Ok(None);
        };
        match parent.hops_remaining().unwrap_or(max) {
            0 => Err(RunnerError::HopLimitExceeded {
                event_id: parent.id().to_string(),
            }),
            remaining => Ok(Some(remaining - 1)),
        }
    }
}
