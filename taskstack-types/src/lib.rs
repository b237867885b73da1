//! Core types shared by every TaskStack crate.
//!
//! - Identifiers: [`EventId`], [`EntityId`], [`DeviceId`]
//! - [`Event`]: the immutable unit of synchronization
//! - [`Version`]: the `(timestamp, sequence, origin)` order used to resolve
//!   concurrent writes

mod event;
mod ids;

pub use event::{
    event_type, now_millis, parse_event_type, Event, EventAction, EventTypeError, NewEvent,
    Version,
};
pub use ids::{DeviceId, EntityId, EventId};
