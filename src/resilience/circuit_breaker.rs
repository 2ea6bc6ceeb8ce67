//! Failure-counting availability gate.
//!
//! ```text
//!   CLOSED --(failure_threshold failures)--> OPEN
//!   OPEN   --(timeout elapsed, next call)--> HALF_OPEN
//!   HALF_OPEN --(success_threshold successes)--> CLOSED
//!   HALF_OPEN --(any failure)--> OPEN
//! ```
//!
//! The protected call runs with the lock released. A half-open trial holds
//! its slot through a [`CallPermit`]; if the call is dropped before its
//! outcome is recorded (timeout, task abort, losing a `select!`) the slot is
//! given back and the call counts as neither a success nor a failure.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utilities::duration_ms;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_concurrent_calls() -> u32 {
    2
}

/// Circuit breaker policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures while closed before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successful trial calls while half-open before the circuit closes.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Time the circuit stays open after the last failure.
    #[serde(default = "default_timeout", with = "duration_ms")]
    pub timeout: Duration,
    /// Trial calls allowed in flight while half-open.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout: default_timeout(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

// ---------------------------------------------------------------------------
// State, errors, metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Rejections produced by the breaker itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CircuitBreakerError {
    #[error("circuit breaker is open")]
    Open,
    #[error("circuit breaker is half-open and at max concurrent calls")]
    HalfOpenSaturated,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub concurrent_calls: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// Called with `(from, to)` after every state transition.
pub type StateChangeCallback = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// Admission ticket returned by [`Breaker::try_acquire`]; hand it back to
/// [`Breaker::record`] once the call finishes.
///
/// A half-open permit owns one trial slot. Dropping it unrecorded frees the
/// slot without recording an outcome.
#[must_use]
#[derive(Debug)]
pub struct CallPermit {
    slot: Option<TrialSlot>,
}

#[derive(Debug)]
struct TrialSlot {
    counters: Arc<Mutex<Counters>>,
    generation: u64,
}

impl CallPermit {
    fn unguarded() -> Self {
        Self { slot: None }
    }

    fn trial(counters: &Arc<Mutex<Counters>>, generation: u64) -> Self {
        Self {
            slot: Some(TrialSlot {
                counters: counters.clone(),
                generation,
            }),
        }
    }

    /// Whether this permit holds a half-open trial slot.
    pub fn is_trial(&self) -> bool {
        self.slot.is_some()
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let mut c = slot.counters.lock();
            c.release_trial(slot.generation);
        }
    }
}

// ---------------------------------------------------------------------------
// Breaker trait
// ---------------------------------------------------------------------------

/// Object-safe breaker surface, so factories can hand out `Arc<dyn Breaker>`.
pub trait Breaker: Send + Sync {
    fn try_acquire(&self) -> Result<CallPermit, CircuitBreakerError>;
    fn record(&self, permit: CallPermit, success: bool);
    fn state(&self) -> CircuitState;
    fn metrics(&self) -> CircuitBreakerMetrics;
}

/// Run `f` through `breaker`. Rejections surface as a [`CircuitBreakerError`]
/// inside the returned `anyhow::Error` and `f` is not invoked.
pub async fn guarded_call<B, F, Fut, T>(breaker: &B, f: F) -> anyhow::Result<T>
where
    B: Breaker + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let permit = breaker.try_acquire()?;
    let result = f().await;
    breaker.record(permit, result.is_ok());
    result
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    concurrent_calls: u32,
    /// Bumped on every entry to half-open; permits from an earlier window
    /// must not free slots in the current one.
    generation: u64,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
}

impl Counters {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            concurrent_calls: 0,
            generation: 0,
            last_failure: None,
            last_failure_time: None,
        }
    }

    fn release_trial(&mut self, generation: u64) {
        if self.state == CircuitState::HalfOpen && self.generation == generation {
            self.concurrent_calls = self.concurrent_calls.saturating_sub(1);
        }
    }

    /// Switch state, returning the transition if it changed anything.
    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some((from, to))
    }
}

/// State-machine circuit breaker guarding one downstream operation.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    counters: Arc<Mutex<Counters>>,
    on_state_change: RwLock<Option<StateChangeCallback>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            counters: Arc::new(Mutex::new(Counters::closed())),
            on_state_change: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn set_state_change_callback<F>(&self, callback: F)
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        *self.on_state_change.write() = Some(Arc::new(callback));
    }

    /// Run `f` if the circuit admits it and record the outcome.
    pub async fn call<F, Fut, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        guarded_call(self, f).await
    }

    /// Force the circuit closed and clear all counters.
    pub fn reset(&self) {
        let change = {
            let mut counters = self.counters.lock();
            let change = counters.transition(CircuitState::Closed);
            let generation = counters.generation;
            *counters = Counters::closed();
            counters.generation = generation;
            change
        };
        self.notify(change);
    }

    fn notify(&self, change: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = change else {
            return;
        };
        log::info!("Circuit breaker '{}' changed {} -> {}", self.name, from, to);
        let callback = self.on_state_change.read().clone();
        if let Some(callback) = callback {
            callback(from, to);
        }
    }
}

impl Breaker for CircuitBreaker {
    fn try_acquire(&self) -> Result<CallPermit, CircuitBreakerError> {
        let mut change = None;
        let admitted = {
            let mut c = self.counters.lock();
            match c.state {
                CircuitState::Closed => Ok(CallPermit::unguarded()),
                CircuitState::Open => {
                    let expired = c
                        .last_failure
                        .map_or(true, |at| at.elapsed() >= self.config.timeout);
                    if expired {
                        change = c.transition(CircuitState::HalfOpen);
                        c.success_count = 0;
                        c.concurrent_calls = 1;
                        c.generation += 1;
                        Ok(CallPermit::trial(&self.counters, c.generation))
                    } else {
                        Err(CircuitBreakerError::Open)
                    }
                }
                CircuitState::HalfOpen => {
                    if c.concurrent_calls >= self.config.max_concurrent_calls {
                        Err(CircuitBreakerError::HalfOpenSaturated)
                    } else {
                        c.concurrent_calls += 1;
                        Ok(CallPermit::trial(&self.counters, c.generation))
                    }
                }
            }
        };
        self.notify(change);
        admitted
    }

    fn record(&self, mut permit: CallPermit, success: bool) {
        let change = {
            let mut c = self.counters.lock();
            if let Some(slot) = permit.slot.take() {
                c.release_trial(slot.generation);
            }

            if success {
                match c.state {
                    CircuitState::Closed => {
                        c.failure_count = 0;
                        None
                    }
                    CircuitState::HalfOpen => {
                        c.success_count += 1;
                        if c.success_count >= self.config.success_threshold {
                            let change = c.transition(CircuitState::Closed);
                            c.failure_count = 0;
                            c.success_count = 0;
                            c.concurrent_calls = 0;
                            change
                        } else {
                            None
                        }
                    }
                    CircuitState::Open => None,
                }
            } else {
                c.failure_count += 1;
                c.last_failure = Some(Instant::now());
                c.last_failure_time = Some(Utc::now());
                match c.state {
                    CircuitState::Closed if c.failure_count >= self.config.failure_threshold => {
                        c.success_count = 0;
                        c.transition(CircuitState::Open)
                    }
                    CircuitState::HalfOpen => {
                        c.success_count = 0;
                        c.transition(CircuitState::Open)
                    }
                    _ => None,
                }
            }
        };
        self.notify(change);
    }

    fn state(&self) -> CircuitState {
        self.counters.lock().state
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        let c = self.counters.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: c.state,
            failure_count: c.failure_count,
            success_count: c.success_count,
            concurrent_calls: c.concurrent_calls,
            last_failure_time: c.last_failure_time,
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// NoopBreaker
// ---------------------------------------------------------------------------

/// Always-closed breaker used when no breaker factory is registered.
#[derive(Debug, Default)]
pub struct NoopBreaker;

impl Breaker for NoopBreaker {
    fn try_acquire(&self) -> Result<CallPermit, CircuitBreakerError> {
        Ok(CallPermit::unguarded())
    }

    fn record(&self, _permit: CallPermit, _success: bool) {}

    fn state(&self) -> CircuitState {
        CircuitState::Closed
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            name: "noop".to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            concurrent_calls: 0,
            last_failure_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(failures: u32, successes: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: failures,
                success_threshold: successes,
                timeout: Duration::from_millis(timeout_ms),
                max_concurrent_calls: 2,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> anyhow::Result<()> {
        cb.call(|| async { Err::<(), _>(anyhow::anyhow!("downstream failed")) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> anyhow::Result<()> {
        cb.call(|| async { Ok(()) }).await
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_calls, 2);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let cb = breaker(3, 2, 60_000);
        for _ in 0..3 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.metrics().last_failure_time.is_some());

        let invoked = AtomicU32::new(0);
        let err = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<CircuitBreakerError>(),
            Some(&CircuitBreakerError::Open)
        );
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_while_closed_resets_failures() {
        let cb = breaker(3, 2, 60_000);
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.metrics().failure_count, 0);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(3, 2, 20);
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        let err = fail(&cb).await.unwrap_err();
        assert!(err.to_string().contains("downstream failed"));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().success_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_successes_close() {
        let cb = breaker(3, 2, 20);
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_limits_concurrent_trials() {
        let cb = CircuitBreaker::new(
            "limited",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 5,
                timeout: Duration::from_millis(10),
                max_concurrent_calls: 1,
            },
        );
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(25)).await;

        let permit = cb.try_acquire().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(
            cb.try_acquire().unwrap_err(),
            CircuitBreakerError::HalfOpenSaturated
        );
        cb.record(permit, true);
        assert_eq!(cb.metrics().concurrent_calls, 0);
        let again = cb.try_acquire().unwrap();
        cb.record(again, true);
    }

    #[tokio::test]
    async fn test_cancelled_trial_call_frees_its_slot() {
        let cb = CircuitBreaker::new(
            "flaky",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 2,
                timeout: Duration::from_millis(10),
                max_concurrent_calls: 1,
            },
        );
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(25)).await;

        let stalled = tokio::time::timeout(
            Duration::from_millis(5),
            cb.call(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }),
        )
        .await;
        assert!(stalled.is_err());

        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::HalfOpen);
        assert_eq!(metrics.concurrent_calls, 0);
        assert_eq!(metrics.success_count, 0);
        assert_eq!(metrics.failure_count, 1);

        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stale_permit_does_not_free_a_newer_trial_slot() {
        let cb = CircuitBreaker::new(
            "stale",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 3,
                timeout: Duration::from_millis(10),
                max_concurrent_calls: 2,
            },
        );
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(25)).await;

        let first = cb.try_acquire().unwrap();
        let second = cb.try_acquire().unwrap();
        assert!(first.is_trial() && second.is_trial());
        cb.record(first, false);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(25)).await;
        let fresh = cb.try_acquire().unwrap();
        assert_eq!(cb.metrics().concurrent_calls, 1);
        drop(second);
        assert_eq!(cb.metrics().concurrent_calls, 1);
        drop(fresh);
        assert_eq!(cb.metrics().concurrent_calls, 0);
    }

    #[tokio::test]
    async fn test_state_change_callback_sees_transitions() {
        let cb = breaker(1, 1, 10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cb.set_state_change_callback(move |from, to| sink.lock().push((from, to)));

        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(25)).await;
        succeed(&cb).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_reset_closes_circuit() {
        let cb = breaker(1, 1, 60_000);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        succeed(&cb).await.unwrap();
    }

    #[tokio::test]
    async fn test_noop_breaker_passes_through() {
        let noop: Arc<dyn Breaker> = Arc::new(NoopBreaker);
        let value = guarded_call(noop.as_ref(), || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(noop.state(), CircuitState::Closed);
    }
}
