//! Pushing work to executors: queue shards for new alerts, broadcast keys
//! for operations on alerts that already have an owner.

mod broadcast;
mod manager;
mod queue;

pub use broadcast::{AlertBroadcast, BroadcastMessage, Operation};
pub use manager::{AlertDispatcher, DispatchError};
pub use queue::AlertQueue;
