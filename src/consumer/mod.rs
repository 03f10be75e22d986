//! Consumers multiplexed over the shared reader connection
//!
//! Each consumer is a task draining its own event queue. Connection changes,
//! host commands, device results and timers all arrive through that queue,
//! so handlers never run concurrently.

mod cyclic_output;
mod digital_input;
mod scanner;

pub use cyclic_output::{CyclicOutputConfig, CyclicOutputWriter};
pub use digital_input::{DigitalInputConfig, DigitalInputPoller};
pub use scanner::{CarrierScanner, ScanCommand, ScannerConfig, ScannerMode};

use crate::connection::{ConnectionManager, StateChange, SubscriptionToken};
use anyhow::anyhow;
use rfid_shared::{NodeError, NodeEvent, NodeStatus};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Channel towards the host runtime
pub type EventSink = mpsc::UnboundedSender<NodeEvent>;

/// Outbound side of a consumer; repeated statuses are not re-emitted
pub(crate) struct Outbox {
    sink: EventSink,
    last_status: Option<NodeStatus>,
}

impl Outbox {
    pub(crate) fn new(sink: EventSink) -> Self {
        Self {
            sink,
            last_status: None,
        }
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        // The host may already be gone during shutdown
        let _ = self.sink.send(event);
    }

    pub(crate) fn report(&self, error: NodeError) {
        self.emit(NodeEvent::Error(error));
    }

    pub(crate) fn status(&mut self, status: NodeStatus) {
        if self.last_status != Some(status) {
            self.last_status = Some(status);
            self.emit(NodeEvent::Status(status));
        }
    }
}

/// Connection-level status shared by the poller and the writer
pub(crate) fn link_status(connecting: bool, connected: bool) -> Option<NodeStatus> {
    if connecting {
        Some(NodeStatus::Connecting)
    } else if !connected {
        Some(NodeStatus::Disconnected)
    } else {
        None
    }
}

/// Time left in a busy hold that started at `since`
pub(crate) fn hold_remaining(since: Option<Instant>, hold: Duration) -> Option<Duration> {
    let elapsed = since?.elapsed();
    hold.checked_sub(elapsed).filter(|left| !left.is_zero())
}

/// Post `event` to a consumer queue after `delay`
pub(crate) fn schedule<E: Send + 'static>(
    delay: Duration,
    queue: &mpsc::UnboundedSender<E>,
    event: E,
) -> JoinHandle<()> {
    let queue = queue.clone();
    tokio::spawn(async move {
        sleep(delay).await;
        let _ = queue.send(event);
    })
}

/// Subscribe a consumer queue to the manager and seed it with the current state
pub(crate) fn attach<E: Send + 'static>(
    manager: &ConnectionManager,
    queue: &mpsc::UnboundedSender<E>,
    wrap: fn(StateChange) -> E,
) -> SubscriptionToken {
    let forward = queue.clone();
    manager.subscribe_with_state(move |change| {
        forward
            .send(wrap(change.clone()))
            .map_err(|_| anyhow!("consumer queue closed"))
    })
}

/// Unsubscribe and wait until the consumer task has released its resources
pub(crate) async fn detach<E>(
    manager: &ConnectionManager,
    token: SubscriptionToken,
    queue: &mpsc::UnboundedSender<E>,
    close: fn(oneshot::Sender<()>) -> E,
) {
    manager.unsubscribe(token);

    let (done, done_rx) = oneshot::channel();
    if queue.send(close(done)).is_ok() {
        let _ = done_rx.await;
    }
}
