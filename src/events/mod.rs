//! Event types and the emitter seam.
//!
//! An [`Event`] is the only thing that travels through a runner's queue.
//! Everything an agent produces for the next hop (follow-ups, routed errors,
//! retries) is packaged as a new `Event` and handed to an [`EventEmitter`].

pub mod emitter;
pub mod event;

pub use emitter::{EmitError, EventEmitter};
pub use event::{
    Event, EventData, HOPS_REMAINING_KEY, RETRY_COUNT_KEY, ROUTE_KEY, SESSION_ID_KEY,
    STATUS_ERROR, STATUS_KEY, STATUS_SUCCESS,
};
