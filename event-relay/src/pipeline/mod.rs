//! Dispatch of envelopes to actions.

mod chain;
mod delivery_queue;

pub use chain::{ActionChain, ChainOutcome};
pub use delivery_queue::{DeliveryQueue, DeliverySender, DeliveryState};
