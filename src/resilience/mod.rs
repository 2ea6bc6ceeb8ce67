//! Reliability primitives: circuit breaking and retry with backoff.
//!
//! Both are usually applied by agents around their own downstream calls;
//! [`ResilientAgent`] packages that pattern as a handler decorator.

pub mod agent;
pub mod circuit_breaker;
pub mod retry;

pub use agent::ResilientAgent;
pub use circuit_breaker::{
    guarded_call, Breaker, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerMetrics, CircuitState, NoopBreaker, StateChangeCallback,
};
pub use retry::{RetryPolicy, RetryResult, Retrier, CANCELLED_MESSAGE};
