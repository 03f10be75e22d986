//! Ordered, fault-isolated fan-out of state changes

use super::StateChange;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Callback invoked for every state change
pub type StateCallback = Arc<dyn Fn(&StateChange) -> anyhow::Result<()> + Send + Sync>;

/// Releasable token returned by `subscribe`; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Entries = Arc<Vec<(SubscriptionToken, StateCallback)>>;

/// Copy-on-write list of subscribers in registration order.
///
/// Every mutation swaps in a new list, so a fan-out in progress keeps
/// iterating its own snapshot.
pub struct SubscriberRegistry {
    next_token: u64,
    entries: Entries,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            next_token: 0,
            entries: Arc::new(Vec::new()),
        }
    }

    pub fn subscribe(&mut self, callback: StateCallback) -> SubscriptionToken {
        self.next_token += 1;
        let token = SubscriptionToken(self.next_token);

        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        entries.extend(self.entries.iter().cloned());
        entries.push((token, callback));
        self.entries = Arc::new(entries);

        token
    }

    /// Returns false if the token was not (or no longer) registered
    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        if !self.entries.iter().any(|(t, _)| *t == token) {
            return false;
        }

        let entries = self
            .entries
            .iter()
            .filter(|(t, _)| *t != token)
            .cloned()
            .collect();
        self.entries = Arc::new(entries);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Immutable view of the current subscribers
    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.entries.clone())
    }
}

/// Subscribers captured at the start of a fan-out
pub struct Snapshot(Entries);

impl Snapshot {
    /// Deliver `change` to every subscriber in order.
    ///
    /// A callback that fails or panics is logged and skipped; the remaining
    /// subscribers are still notified. Returns the number of failures.
    pub fn notify(&self, change: &StateChange) -> usize {
        let mut failures = 0;

        for (token, callback) in self.0.iter() {
            match catch_unwind(AssertUnwindSafe(|| callback(change))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!("[CONN] Subscriber {} failed: {:#}", token, e);
                }
                Err(_) => {
                    failures += 1;
                    error!("[CONN] Subscriber {} panicked", token);
                }
            }
        }

        failures
    }
}
