//! Idempotency registries for inbound chat events.
//!
//! Two independent layers: [`InboundEventRegistry`] suppresses duplicate deliveries of the same
//! event for a few minutes, [`RequestRegistry`] enforces "one progress update, one terminal
//! result" per request for the lifetime of its processing.

pub mod events;
pub mod request;

pub use events::{EventKey, InboundEventRegistry};
pub use request::{InFlightRequest, RequestRegistry};
