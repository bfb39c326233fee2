//! scatter-core — wire envelopes, component roles, and substrate adapters.
//! All other scatter crates depend on this one.

pub mod substrate;
pub mod wire;

pub use substrate::{InboundAction, LocalBus, NatsSubstrate, ResultStream, Substrate, SubstrateError};
pub use wire::{Action, ActionResult, Event, Role, SubscriptionFilter};
