//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::{guarded_call, Breaker};
use crate::error_routing::{ErrorClassifier, ErrorCode, KeywordClassifier};
use crate::utilities::duration_ms;

/// Message recorded when cancellation interrupts a retry run.
pub const CANCELLED_MESSAGE: &str = "retry cancelled: operation cancelled";

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_retryable_errors() -> Vec<ErrorCode> {
    vec![ErrorCode::Timeout, ErrorCode::Network, ErrorCode::Llm]
}

/// Immutable retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay", with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(default = "default_max_delay", with = "duration_ms")]
    pub max_delay: Duration,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<ErrorCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
            retryable_errors: default_retryable_errors(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn single_attempt() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    ///
    /// `initial_delay * backoff_factor^(attempt-1)`, clamped to `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// [`base_delay`](Self::base_delay) perturbed by up to ±10% when jitter is on.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-0.1..=0.1);
        Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
    }
}

// ---------------------------------------------------------------------------
// RetryResult
// ---------------------------------------------------------------------------

/// What happened during a retry run.
#[derive(Debug)]
pub struct RetryResult<T> {
    pub value: Option<T>,
    pub success: bool,
    /// Number of times the operation was started; `1..=max_retries + 1`.
    pub attempts: u32,
    pub total_duration: Duration,
    pub last_error: Option<String>,
    /// Every failure message, oldest first.
    pub errors: Vec<String>,
}

impl<T> RetryResult<T> {
    pub fn into_result(self) -> anyhow::Result<T> {
        match self.value {
            Some(value) => Ok(value),
            None => Err(anyhow::anyhow!(
                "operation failed after {} attempt(s): {}",
                self.attempts,
                self.last_error.unwrap_or_else(|| "unknown error".to_string())
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Retrier
// ---------------------------------------------------------------------------

/// Executes operations under a [`RetryPolicy`].
#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    classifier: Arc<dyn ErrorClassifier>,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: Arc::new(KeywordClassifier::default()),
        }
    }

    /// Use `classifier` to map error messages onto retryable codes.
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether an error message is covered by the policy's retryable codes,
    /// either literally or through the classifier.
    pub fn should_retry(&self, message: &str) -> bool {
        if self
            .policy
            .retryable_errors
            .iter()
            .any(|code| message.contains(code.as_str()))
        {
            return true;
        }
        let code = self.classifier.classify(message).code;
        self.policy.retryable_errors.contains(&code)
    }

    /// Run `op` until it succeeds, a non-retryable error occurs, attempts
    /// run out, or `ctx` is cancelled.
    pub async fn execute<F, Fut, T>(&self, ctx: &CancellationToken, mut op: F) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut errors = Vec::new();
        let mut attempts = 0;

        while attempts < max_attempts {
            if ctx.is_cancelled() {
                errors.push(CANCELLED_MESSAGE.to_string());
                break;
            }

            attempts += 1;
            match op().await {
                Ok(value) => {
                    return RetryResult {
                        value: Some(value),
                        success: true,
                        attempts,
                        total_duration: started.elapsed(),
                        last_error: errors.last().cloned(),
                        errors,
                    };
                }
                Err(err) => {
                    let message = format!("{:#}", err);
                    let retryable = self.should_retry(&message);
                    errors.push(message.clone());

                    if attempts >= max_attempts {
                        log::warn!("Giving up after {} attempt(s): {}", attempts, message);
                        break;
                    }
                    if !retryable {
                        log::debug!("Not retrying non-retryable error: {}", message);
                        break;
                    }

                    let delay = self.policy.calculate_delay(attempts);
                    log::debug!(
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempts,
                        max_attempts,
                        message,
                        delay
                    );
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            errors.push(CANCELLED_MESSAGE.to_string());
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        RetryResult {
            value: None,
            success: false,
            attempts: attempts.max(1),
            total_duration: started.elapsed(),
            last_error: errors.last().cloned(),
            errors,
        }
    }

    /// Like [`execute`](Self::execute), but every attempt first passes
    /// through `breaker`. An open circuit counts as a failed attempt.
    pub async fn execute_with_circuit_breaker<B, F, Fut, T>(
        &self,
        ctx: &CancellationToken,
        breaker: &B,
        mut op: F,
    ) -> RetryResult<T>
    where
        B: Breaker + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute(ctx, move || {
            let attempt = op();
            async move { guarded_call(breaker, || attempt).await }
        })
        .await
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier").field("policy", &self.policy).finish()
    }
}
