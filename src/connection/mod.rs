//! Connection management for the shared reader connection
//!
//! This module handles:
//! - The connect / retry loop with a fixed reconnect delay
//! - Fan-out of state changes to subscribed consumers
//! - Ownership of the single live device link

mod handle;
mod manager;
mod registry;

pub use handle::{Connection, ConnectionId, ConnectionState, StateChange};
pub use manager::{ConnectionConfig, ConnectionManager};
pub use registry::{StateCallback, SubscriberRegistry, SubscriptionToken};
