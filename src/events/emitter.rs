//! Injection point for putting events back onto a queue.

use async_trait::async_trait;
use thiserror::Error;

use super::event::Event;

/// Errors returned when an event cannot be enqueued.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmitError {
    #[error("runner is not running")]
    NotRunning,
    #[error("failed to emit event: queue full or blocked")]
    QueueFull,
    #[error("runner stopped while emitting")]
    StoppedWhileEmitting,
    #[error("emitter target has been dropped")]
    Detached,
    #[error("hop limit reached; event {event_id} not queued")]
    HopLimitReached { event_id: String },
}

/// Something that accepts events for later processing.
///
/// Orchestrators and recovery agents receive an emitter rather than a
/// reference to the runner that owns the queue.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: Event) -> Result<(), EmitError>;
}
