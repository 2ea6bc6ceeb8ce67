//! Fan-out dispatch: every registered agent handles the event concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{
    before_agent_run, invoke_agent, seed_state, AgentSet, OrchestrationConfig, OrchestrationError,
    OrchestrationMode, Orchestrator,
};
use crate::events::Event;
use crate::handler::{AgentHandler, AgentOutcome, AgentResult};
use crate::hooks::CallbackRegistry;
use crate::state::State;

/// Runs all agents on clones of the same input and merges their outputs.
///
/// Concurrency is capped by `max_concurrency`. Outputs are merged in
/// registration order, so when two agents write the same key the one
/// registered later wins. Dispatch fails when every agent fails, when the
/// share of failures reaches `failure_threshold`, or on `timeout`.
pub struct CollaborativeOrchestrator {
    agents: AgentSet,
    callbacks: Arc<CallbackRegistry>,
    config: OrchestrationConfig,
    mode: OrchestrationMode,
    shutdown: CancellationToken,
}

impl CollaborativeOrchestrator {
    pub fn new(callbacks: Arc<CallbackRegistry>, config: OrchestrationConfig) -> Self {
        Self {
            agents: AgentSet::new(),
            callbacks,
            config,
            mode: OrchestrationMode::Collaborate,
            shutdown: CancellationToken::new(),
        }
    }

    /// Same strategy, reported as [`OrchestrationMode::Parallel`].
    pub fn parallel(callbacks: Arc<CallbackRegistry>, config: OrchestrationConfig) -> Self {
        Self {
            mode: OrchestrationMode::Parallel,
            ..Self::new(callbacks, config)
        }
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Fan `state` out to every agent and merge the results into it.
    pub async fn run_group(
        &self,
        ctx: &CancellationToken,
        event: &Event,
        state: State,
    ) -> Result<AgentResult, OrchestrationError> {
        let agents = self.agents.snapshot();
        if agents.is_empty() {
            return Err(OrchestrationError::NoAgents { mode: self.mode });
        }
        if self.shutdown.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }

        let started = Utc::now();
        let total = agents.len();
        let group = ctx.child_token();
        let _guard = group.clone().drop_guard();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let mut tasks = JoinSet::new();
        for (index, (name, handler)) in agents.into_iter().enumerate() {
            let callbacks = self.callbacks.clone();
            let event = event.clone();
            let input = state.clone();
            let token = group.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let outcome = tokio::select! {
                    _ = token.cancelled() => Err(anyhow::anyhow!("agent {} cancelled before start", name)),
                    permit = permits.acquire_owned() => match permit {
                        Ok(_permit) => {
                            let input = before_agent_run(&callbacks, &event, &name, input);
                            invoke_agent(&callbacks, &token, &event, &name, &handler, input).await
                        }
                        Err(err) => Err(anyhow::Error::from(err)),
                    },
                };
                (index, name, outcome)
            });
        }

        let collect = self.collect(&mut tasks, total);
        let collected = tokio::select! {
            _ = self.shutdown.cancelled() => Err(OrchestrationError::Cancelled),
            _ = ctx.cancelled() => Err(OrchestrationError::Cancelled),
            res = tokio::time::timeout(self.config.timeout, collect) => match res {
                Ok(res) => res,
                Err(_) => Err(OrchestrationError::Timeout(self.config.timeout)),
            },
        };
        if collected.is_err() {
            group.cancel();
            tasks.abort_all();
        }
        let outcomes = collected?;

        let mut merged = state;
        for outcome in &outcomes {
            if let Some(output) = outcome.result.as_ref().and_then(|r| r.output_state.as_ref()) {
                merged.merge(output);
            }
        }
        let mut result = AgentResult::success(merged).timed(started);
        result.outcomes = outcomes;
        Ok(result)
    }

    async fn collect(
        &self,
        tasks: &mut JoinSet<(usize, String, anyhow::Result<AgentResult>)>,
        total: usize,
    ) -> Result<Vec<AgentOutcome>, OrchestrationError> {
        let mut slots: Vec<Option<AgentOutcome>> = (0..total).map(|_| None).collect();
        let mut failed = 0usize;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, agent, Ok(result))) => {
                    slots[index] = Some(AgentOutcome {
                        agent,
                        result: Some(result),
                        error: None,
                    });
                }
                Ok((index, agent, Err(err))) => {
                    log::warn!("Collaborative agent '{}' failed: {}", agent, err);
                    failed += 1;
                    slots[index] = Some(AgentOutcome {
                        agent,
                        result: None,
                        error: Some(err.to_string()),
                    });
                }
                Err(err) => {
                    log::error!("Collaborative agent task did not complete: {}", err);
                    failed += 1;
                }
            }

            if failed == total {
                return Err(OrchestrationError::AllAgentsFailed {
                    outcomes: slots.into_iter().flatten().collect(),
                });
            }
            let ratio = failed as f64 / total as f64;
            if failed > 0 && ratio >= self.config.failure_threshold {
                tasks.abort_all();
                return Err(OrchestrationError::ThresholdExceeded {
                    failed,
                    total,
                    threshold: self.config.failure_threshold,
                    outcomes: slots.into_iter().flatten().collect(),
                });
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

#[async_trait]
impl Orchestrator for CollaborativeOrchestrator {
    async fn dispatch(
        &self,
        ctx: &CancellationToken,
        event: &Event,
    ) -> Result<AgentResult, OrchestrationError> {
        self.run_group(ctx, event, seed_state(event)).await
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
        self.mode
    }

    fn agent_names(&self) -> Vec<String> {
        self.agents.names()
    }

    fn stop(&self) {
        log::debug!("Collaborative orchestrator stopping");
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventData;
    use crate::orchestration::testing::{FailingAgent, SetAgent, SlowAgent};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn orchestrator(config: OrchestrationConfig) -> CollaborativeOrchestrator {
        CollaborativeOrchestrator::new(Arc::new(CallbackRegistry::new()), config)
    }

    fn event() -> Event {
        Event::routed("team", "s1", EventData::new())
    }

    #[tokio::test]
    async fn test_outputs_merge_in_registration_order() {
        let orch = orchestrator(OrchestrationConfig::default());
        orch.register_agent("slow", Arc::new(SlowAgent::new("slow", Duration::from_millis(30))))
            .unwrap();
        orch.register_agent("first", Arc::new(SetAgent::new("shared", json!("first"))))
            .unwrap();
        orch.register_agent("second", Arc::new(SetAgent::new("shared", json!("second"))))
            .unwrap();

        let result = orch.dispatch(&CancellationToken::new(), &event()).await.unwrap();
        let agents: Vec<_> = result.outcomes.iter().map(|o| o.agent.as_str()).collect();
        assert_eq!(agents, vec!["slow", "first", "second"]);
        let out = result.output_state.unwrap();
        assert_eq!(out.get("shared"), Some(&json!("second")));
        assert_eq!(out.get("slow"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_every_agent_gets_an_independent_copy() {
        let orch = orchestrator(OrchestrationConfig::default());
        let a = Arc::new(SetAgent::new("a", json!(1)));
        let b = Arc::new(SetAgent::new("b", json!(2)));
        orch.register_agent("a", a.clone()).unwrap();
        orch.register_agent("b", b.clone()).unwrap();
        orch.dispatch(&CancellationToken::new(), &event()).await.unwrap();
        assert!(a.seen.lock()[0].get("b").is_none());
        assert!(b.seen.lock()[0].get("a").is_none());
    }

    #[tokio::test]
    async fn test_partial_failure_under_threshold() {
        let orch = orchestrator(OrchestrationConfig {
            failure_threshold: 0.6,
            ..OrchestrationConfig::default()
        });
        orch.register_agent("ok-1", Arc::new(SetAgent::new("x", json!(1))))
            .unwrap();
        orch.register_agent("bad", Arc::new(FailingAgent::new("nope")))
            .unwrap();
        orch.register_agent("ok-2", Arc::new(SetAgent::new("y", json!(2))))
            .unwrap();

        let result = orch.dispatch(&CancellationToken::new(), &event()).await.unwrap();
        assert_eq!(result.outcomes.len(), 3);
        assert!(!result.outcomes[1].succeeded());
        assert_eq!(result.outcomes[1].error.as_deref(), Some("nope"));
        let out = result.output_state.unwrap();
        assert_eq!(out.get("x"), Some(&json!(1)));
        assert_eq!(out.get("y"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_threshold_aborts_remaining_work() {
        let orch = orchestrator(OrchestrationConfig::default());
        let slow = Arc::new(SlowAgent::new("slow", Duration::from_secs(5)));
        orch.register_agent("bad", Arc::new(FailingAgent::new("broken")))
            .unwrap();
        orch.register_agent("slow", slow.clone()).unwrap();

        let err = orch
            .dispatch(&CancellationToken::new(), &event())
            .await
            .unwrap_err();
        match err {
            OrchestrationError::ThresholdExceeded { failed, total, .. } => {
                assert_eq!((failed, total), (1, 2));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(slow.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_agents_failed() {
        let orch = orchestrator(OrchestrationConfig {
            failure_threshold: 1.0,
            ..OrchestrationConfig::default()
        });
        orch.register_agent("a", Arc::new(FailingAgent::new("a down")))
            .unwrap();
        orch.register_agent("b", Arc::new(FailingAgent::new("b down")))
            .unwrap();
        let err = orch
            .dispatch(&CancellationToken::new(), &event())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "collaborative dispatch failed: all agents returned errors"
        );
        if let OrchestrationError::AllAgentsFailed { outcomes } = err {
            assert_eq!(outcomes.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let orch = orchestrator(OrchestrationConfig {
            timeout: Duration::from_millis(20),
            ..OrchestrationConfig::default()
        });
        orch.register_agent("slow", Arc::new(SlowAgent::new("slow", Duration::from_secs(5))))
            .unwrap();
        let err = orch
            .dispatch(&CancellationToken::new(), &event())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Timeout(_)));
        assert!(err.to_string().starts_with("collaborative dispatch timeout after"));
    }

    #[tokio::test]
    async fn test_concurrency_cap_of_one_serializes() {
        let orch = orchestrator(OrchestrationConfig {
            max_concurrency: 1,
            ..OrchestrationConfig::default()
        });
        for name in ["a", "b", "c"] {
            orch.register_agent(name, Arc::new(SlowAgent::new(name, Duration::from_millis(15))))
                .unwrap();
        }
        let started = std::time::Instant::now();
        let result = orch.dispatch(&CancellationToken::new(), &event()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert_eq!(result.outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_no_agents_and_stopped() {
        let orch = orchestrator(OrchestrationConfig::default());
        let err = orch
            .dispatch(&CancellationToken::new(), &event())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::NoAgents { .. }));

        orch.register_agent("a", Arc::new(SetAgent::new("a", json!(1))))
            .unwrap();
        orch.stop();
        let err = orch
            .dispatch(&CancellationToken::new(), &event())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Cancelled));
    }
}
