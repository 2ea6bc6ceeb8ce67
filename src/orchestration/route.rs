//! Dispatch to the single agent named by the event's `route` metadata.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::{
    before_agent_run, invoke_agent, AgentSet, OrchestrationError, OrchestrationMode, Orchestrator,
};
use crate::events::{Event, EventEmitter, ROUTE_KEY};
use crate::handler::{AgentHandler, AgentResult, RouteChange};
use crate::hooks::CallbackRegistry;
use crate::state::State;

/// Build the continuation event for an output that asks for a different route.
///
/// Returns `None` when the output has no route, an empty route, or the same
/// route as `original`. The continuation gets the ID `<original>-route-<new>`,
/// the original metadata with the new route laid over it, and the output data
/// as payload.
pub fn reconcile_route(original: &Event, output: &State) -> Option<Event> {
    let new_route = output.get_meta(ROUTE_KEY).filter(|r| !r.is_empty())?;
    if original.route() == Some(new_route) {
        return None;
    }

    let mut metadata = original.metadata_copy();
    metadata.insert(ROUTE_KEY.to_string(), new_route.to_string());
    let mut event = Event::with_id(
        format!("{}-route-{}", original.id(), new_route),
        new_route,
        output.data().clone(),
        metadata,
    );
    event.set_source_agent_id(original.route().unwrap_or_else(|| original.target_agent_id()));
    Some(event)
}

/// The event that should carry `output` onward: the reconciled continuation,
/// or `original` unchanged when the route did not move.
pub fn ensure_proper_routing(original: &Event, output: &State) -> Event {
    reconcile_route(original, output).unwrap_or_else(|| original.clone())
}

/// Routes each event to `metadata["route"]`.
pub struct RouteOrchestrator {
    agents: AgentSet,
    callbacks: Arc<CallbackRegistry>,
    emitter: RwLock<Option<Arc<dyn EventEmitter>>>,
}

impl RouteOrchestrator {
    pub fn new(callbacks: Arc<CallbackRegistry>) -> Self {
        Self {
            agents: AgentSet::new(),
            callbacks,
            emitter: RwLock::new(None),
        }
    }

    /// Attach an emitter used to publish route changes directly.
    ///
    /// Without one, route changes are returned in
    /// [`AgentResult::route_change`] for the caller to act on.
    pub fn set_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.emitter.write() = Some(emitter);
    }

    async fn publish(&self, event: Event) -> RouteChange {
        let emitter = self.emitter.read().clone();
        let Some(emitter) = emitter else {
            return RouteChange {
                event,
                emitted: false,
                emit_error: None,
            };
        };
        match emitter.emit(event.clone()).await {
            Ok(()) => RouteChange {
                event,
                emitted: true,
                emit_error: None,
            },
            Err(err) => {
                log::warn!("Failed to emit route change {}: {}", event.id(), err);
                RouteChange {
                    event,
                    emitted: false,
                    emit_error: Some(err.to_string()),
                }
            }
        }
    }
}

#[async_trait]
impl Orchestrator for RouteOrchestrator {
    async fn dispatch(
        &self,
        ctx: &CancellationToken,
        event: &Event,
    ) -> Result<AgentResult, OrchestrationError> {
        let target = event
            .metadata_value(ROUTE_KEY)
            .ok_or_else(|| OrchestrationError::MissingRoute {
                key: ROUTE_KEY,
                event_id: event.id().to_string(),
            })?;
        let handler = self
            .agents
            .get(target)
            .ok_or_else(|| OrchestrationError::UnknownAgent {
                target: target.to_string(),
                event_id: event.id().to_string(),
            })?;

        let mut state = before_agent_run(&self.callbacks, event, target, State::new());
        state.merge_data(event.data());

        log::debug!("Routing event {} to agent '{}'", event.id(), target);
        let mut result = invoke_agent(&self.callbacks, ctx, event, target, &handler, state)
            .await
            .map_err(|source| OrchestrationError::AgentFailed {
                agent: target.to_string(),
                source,
            })?;

        let continuation = result
            .output_state
            .as_ref()
            .and_then(|output| reconcile_route(event, output));
        if let Some(next) = continuation {
            log::debug!("Agent '{}' moved event {} to '{}'", target, event.id(), next.target_agent_id());
            result.route_change = Some(self.publish(next).await);
        }
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
        OrchestrationMode::Route
    }

    fn agent_names(&self) -> Vec<String> {
        self.agents.names()
    }

    fn stop(&self) {
        log::debug!("Route orchestrator stopping");
        *self.emitter.write() = None;
    }
}
