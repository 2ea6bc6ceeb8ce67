//! Hook-keyed callback registry for pipeline instrumentation.
//!
//! Callbacks are named and attached to a [`HookPoint`]. At each point the
//! runner or an orchestrator calls [`CallbackRegistry::invoke`], which runs
//! the callbacks in registration order and threads a [`State`] through them.
//!
//! Whether a failing callback is fatal is decided by the caller: the runner
//! drops an event whose `BeforeEventHandling` callbacks fail, while
//! orchestrators only log callback failures.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::Event;
use crate::handler::AgentResult;
use crate::state::State;

// ---------------------------------------------------------------------------
// Hook points
// ---------------------------------------------------------------------------

/// A named stage in the pipeline where callbacks may observe or modify state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    BeforeEventHandling,
    AfterEventHandling,
    BeforeAgentRun,
    AfterAgentRun,
    AgentError,
    /// Callbacks registered here run after the hook-specific ones at every point.
    All,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeEventHandling => "before_event_handling",
            Self::AfterEventHandling => "after_event_handling",
            Self::BeforeAgentRun => "before_agent_run",
            Self::AfterAgentRun => "after_agent_run",
            Self::AgentError => "agent_error",
            Self::All => "all",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Callback types
// ---------------------------------------------------------------------------

/// Read-only context handed to every callback.
#[derive(Debug, Clone, Copy)]
pub struct CallbackArgs<'a> {
    pub hook: HookPoint,
    pub event: &'a Event,
    pub agent_id: &'a str,
    pub agent_result: Option<&'a AgentResult>,
    pub error: Option<&'a str>,
}

impl<'a> CallbackArgs<'a> {
    pub fn new(hook: HookPoint, event: &'a Event) -> Self {
        Self {
            hook,
            event,
            agent_id: "",
            agent_result: None,
            error: None,
        }
    }

    pub fn agent(mut self, agent_id: &'a str) -> Self {
        self.agent_id = agent_id;
        self
    }

    pub fn result(mut self, result: &'a AgentResult) -> Self {
        self.agent_result = Some(result);
        self
    }

    pub fn error(mut self, error: &'a str) -> Self {
        self.error = Some(error);
        self
    }
}

/// A registered callback. It may mutate or replace the state in place.
pub type CallbackFn =
    Arc<dyn Fn(&CallbackArgs<'_>, &mut State) -> anyhow::Result<()> + Send + Sync>;

/// Registration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("callback name must not be empty")]
    EmptyName,
}

/// A callback returned an error; later callbacks for that invocation did not run.
#[derive(Debug, Error)]
#[error("callback '{callback}' failed at {hook}: {source}")]
pub struct CallbackFailure {
    pub hook: HookPoint,
    pub callback: String,
    /// State as it was when the failing callback returned.
    pub state: State,
    #[source]
    pub source: anyhow::Error,
}

// ---------------------------------------------------------------------------
// CallbackRegistry
// ---------------------------------------------------------------------------

/// Ordered, named callbacks per hook point.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<HookPoint, Vec<(String, CallbackFn)>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `name`. Re-registering a name replaces the
    /// previous callback and keeps its position.
    pub fn register<F>(
        &self,
        hook: HookPoint,
        name: impl Into<String>,
        callback: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&CallbackArgs<'_>, &mut State) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_arc(hook, name, Arc::new(callback))
    }

    /// Register an already shared callback.
    pub fn register_arc(
        &self,
        hook: HookPoint,
        name: impl Into<String>,
        callback: CallbackFn,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let mut callbacks = self.callbacks.write();
        let entries = callbacks.entry(hook).or_default();
        match entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => {
                log::debug!("Replacing callback '{}' at {}", name, hook);
                entry.1 = callback;
            }
            None => entries.push((name, callback)),
        }
        Ok(())
    }

    /// Remove a callback. Unknown names are ignored.
    pub fn unregister(&self, hook: HookPoint, name: &str) {
        let mut callbacks = self.callbacks.write();
        if let Some(entries) = callbacks.get_mut(&hook) {
            entries.retain(|(existing, _)| existing != name);
        }
    }

    /// Names registered at `hook`, in invocation order.
    pub fn callbacks_for(&self, hook: HookPoint) -> Vec<String> {
        self.callbacks
            .read()
            .get(&hook)
            .map(|entries| entries.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default()
    }

    /// Run the callbacks for `args.hook` followed by those for [`HookPoint::All`].
    ///
    /// The registry lock is not held while callbacks run, so a callback may
    /// register or unregister others; changes apply to the next invocation.
    pub fn invoke(&self, args: &CallbackArgs<'_>, state: State) -> Result<State, CallbackFailure> {
        let snapshot = self.snapshot(args.hook);
        let mut state = state;
        for (name, callback) in snapshot {
            if let Err(source) = callback(args, &mut state) {
                return Err(CallbackFailure {
                    hook: args.hook,
                    callback: name,
                    state,
                    source,
                });
            }
        }
        Ok(state)
    }

    fn snapshot(&self, hook: HookPoint) -> Vec<(String, CallbackFn)> {
        let callbacks = self.callbacks.read();
        let mut out = Vec::new();
        if let Some(entries) = callbacks.get(&hook) {
            out.extend(entries.iter().cloned());
        }
        if hook != HookPoint::All {
            if let Some(entries) = callbacks.get(&HookPoint::All) {
                out.extend(entries.iter().cloned());
            }
        }
        out
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let callbacks = self.callbacks.read();
        let mut map = f.debug_map();
        for (hook, entries) in callbacks.iter() {
            let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
            map.entry(&hook.as_str(), &names);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventData;
    use parking_lot::Mutex;
    use serde_json::json;

    fn event() -> Event {
        Event::routed("writer", "s1", EventData::new())
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = CallbackRegistry::new();
        let err = registry
            .register(HookPoint::BeforeAgentRun, "", |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(err, RegistryError::EmptyName);
    }

    #[test]
    fn test_invoke_threads_state_in_registration_order() {
        let registry = CallbackRegistry::new();
        registry
            .register(HookPoint::BeforeAgentRun, "first", |_, state| {
                state.set("trail", json!("a"));
                Ok(())
            })
            .unwrap();
        registry
            .register(HookPoint::BeforeAgentRun, "second", |_, state| {
                let prev = state.get("trail").and_then(|v| v.as_str()).unwrap_or("");
                let next = format!("{}b", prev);
                state.set("trail", json!(next));
                Ok(())
            })
            .unwrap();

        let ev = event();
        let state = registry
            .invoke(&CallbackArgs::new(HookPoint::BeforeAgentRun, &ev), State::new())
            .unwrap();
        assert_eq!(state.get("trail"), Some(&json!("ab")));
    }

    #[test]
    fn test_duplicate_name_overwrites_in_place() {
        let registry = CallbackRegistry::new();
        registry
            .register(HookPoint::AfterAgentRun, "x", |_, _| Ok(()))
            .unwrap();
        registry
            .register(HookPoint::AfterAgentRun, "y", |_, _| Ok(()))
            .unwrap();
        registry
            .register(HookPoint::AfterAgentRun, "x", |_, state| {
                state.set("replaced", json!(true));
                Ok(())
            })
            .unwrap();

        assert_eq!(registry.callbacks_for(HookPoint::AfterAgentRun), vec!["x", "y"]);
        let ev = event();
        let state = registry
            .invoke(&CallbackArgs::new(HookPoint::AfterAgentRun, &ev), State::new())
            .unwrap();
        assert_eq!(state.get("replaced"), Some(&json!(true)));
    }

    #[test]
    fn test_first_error_stops_and_keeps_partial_state() {
        let registry = CallbackRegistry::new();
        let ran_third = Arc::new(Mutex::new(false));
        registry
            .register(HookPoint::BeforeEventHandling, "mutate", |_, state| {
                state.set("touched", json!(1));
                Ok(())
            })
            .unwrap();
        registry
            .register(HookPoint::BeforeEventHandling, "reject", |_, _| {
                Err(anyhow::anyhow!("payload rejected"))
            })
            .unwrap();
        let flag = ran_third.clone();
        registry
            .register(HookPoint::BeforeEventHandling, "never", move |_, _| {
                *flag.lock() = true;
                Ok(())
            })
            .unwrap();

        let ev = event();
        let failure = registry
            .invoke(
                &CallbackArgs::new(HookPoint::BeforeEventHandling, &ev),
                State::new(),
            )
            .unwrap_err();
        assert_eq!(failure.callback, "reject");
        assert_eq!(failure.state.get("touched"), Some(&json!(1)));
        assert!(failure.to_string().contains("payload rejected"));
        assert!(!*ran_third.lock());
    }

    #[test]
    fn test_all_hook_runs_after_specific() {
        let registry = CallbackRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        registry
            .register(HookPoint::All, "global", move |args, _| {
                o1.lock().push(format!("all:{}", args.hook));
                Ok(())
            })
            .unwrap();
        let o2 = order.clone();
        registry
            .register(HookPoint::AgentError, "specific", move |args, _| {
                o2.lock().push(format!("specific:{}", args.error.unwrap_or("")));
                Ok(())
            })
            .unwrap();

        let ev = event();
        registry
            .invoke(
                &CallbackArgs::new(HookPoint::AgentError, &ev).error("boom"),
                State::new(),
            )
            .unwrap();
        assert_eq!(
            *order.lock(),
            vec!["specific:boom".to_string(), "all:agent_error".to_string()]
        );
    }

    #[test]
    fn test_unregister_missing_is_noop() {
        let registry = CallbackRegistry::new();
        registry.unregister(HookPoint::AfterEventHandling, "ghost");
        registry
            .register(HookPoint::AfterEventHandling, "real", |_, _| Ok(()))
            .unwrap();
        registry.unregister(HookPoint::AfterEventHandling, "real");
        assert!(registry.callbacks_for(HookPoint::AfterEventHandling).is_empty());
    }

    #[test]
    fn test_callback_can_register_during_invoke() {
        let registry = Arc::new(CallbackRegistry::new());
        let inner = registry.clone();
        registry
            .register(HookPoint::BeforeAgentRun, "installer", move |_, _| {
                inner
                    .register(HookPoint::BeforeAgentRun, "installed", |_, _| Ok(()))
                    .map_err(anyhow::Error::from)
            })
            .unwrap();
        let ev = event();
        registry
            .invoke(&CallbackArgs::new(HookPoint::BeforeAgentRun, &ev), State::new())
            .unwrap();
        assert_eq!(
            registry.callbacks_for(HookPoint::BeforeAgentRun),
            vec!["installer", "installed"]
        );
    }
}
