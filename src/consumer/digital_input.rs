//! Digital input poller
//!
//! Claims one pin on the current connection and reads it at a fixed
//! interval. Readings are forwarded to the host according to the configured
//! [`EdgePolicy`].

use super::{attach, detach, hold_remaining, link_status, schedule, EventSink, Outbox};
use crate::connection::{Connection, ConnectionManager, StateChange, SubscriptionToken};
use crate::device::DigitalInputPin;
use rfid_shared::limits::DIGITAL_INPUT_PINS;
use rfid_shared::{
    format_chain, timing, ConfigError, DeviceError, EdgePolicy, NodeError, NodeEvent, NodeStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigitalInputConfig {
    pub pin: u8,
    pub poll_interval: Duration,
    pub policy: EdgePolicy,
}

impl DigitalInputConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !DIGITAL_INPUT_PINS.contains(&self.pin) {
            return Err(ConfigError::InvalidPin(self.pin));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("poll interval"));
        }
        Ok(())
    }
}

enum PollerEvent {
    StateChanged(StateChange),
    Read {
        generation: u64,
        result: Result<bool, DeviceError>,
    },
    StatusRefresh,
    Close(oneshot::Sender<()>),
}

/// Handle to a running digital input poller
pub struct DigitalInputPoller {
    manager: ConnectionManager,
    token: SubscriptionToken,
    queue: mpsc::UnboundedSender<PollerEvent>,
}

impl DigitalInputPoller {
    pub fn spawn(
        config: DigitalInputConfig,
        manager: &ConnectionManager,
        sink: EventSink,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (queue, events) = mpsc::unbounded_channel();
        let task = PollerTask {
            config,
            queue: queue.clone(),
            outbox: Outbox::new(sink),
            connecting: false,
            connection: None,
            binding: None,
            generation: 0,
            last_value: None,
            last_trigger_at: None,
            read_error: None,
            refresh: None,
        };
        tokio::spawn(task.run(events));

        let token = attach(manager, &queue, PollerEvent::StateChanged);
        Ok(Self {
            manager: manager.clone(),
            token,
            queue,
        })
    }

    /// Stop polling and release the pin
    pub async fn close(&self) {
        detach(&self.manager, self.token, &self.queue, PollerEvent::Close).await;
    }
}

struct Binding {
    pin: Arc<dyn DigitalInputPin>,
    poll_task: JoinHandle<()>,
}

struct PollerTask {
    config: DigitalInputConfig,
    queue: mpsc::UnboundedSender<PollerEvent>,
    outbox: Outbox,
    connecting: bool,
    connection: Option<Connection>,
    binding: Option<Binding>,
    /// Incremented on every bind; readings from older binds are dropped
    generation: u64,
    last_value: Option<bool>,
    last_trigger_at: Option<Instant>,
    read_error: Option<DeviceError>,
    refresh: Option<JoinHandle<()>>,
}

impl PollerTask {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<PollerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PollerEvent::StateChanged(change) => self.on_state_change(change),
                PollerEvent::Read { generation, result } => self.on_read(generation, result),
                PollerEvent::StatusRefresh => {
                    self.refresh = None;
                    self.update_status();
                }
                PollerEvent::Close(done) => {
                    self.unbind();
                    if let Some(refresh) = self.refresh.take() {
                        refresh.abort();
                    }
                    let _ = done.send(());
                    break;
                }
            }
        }
    }

    fn on_state_change(&mut self, change: StateChange) {
        self.connecting = change.connecting;

        let current = self.connection.as_ref().map(Connection::id);
        let next = change.connection.as_ref().map(Connection::id);
        if current != next {
            self.unbind();
            self.connection = change.connection;
            if let Some(connection) = self.connection.clone() {
                self.bind(&connection);
            }
        }

        self.update_status();
    }

    fn bind(&mut self, connection: &Connection) {
        let pin = match connection.claim_digital_input(self.config.pin) {
            Ok(pin) => pin,
            Err(e) => {
                error!("[DI] Claiming pin {} failed: {}", self.config.pin, format_chain(&e));
                self.outbox.report(NodeError::reported(&e));
                return;
            }
        };

        self.generation += 1;
        let poll_task = tokio::spawn(poll_pin(
            pin.clone(),
            self.config.poll_interval,
            self.generation,
            self.queue.clone(),
        ));

        info!(
            "[DI] Polling pin {} every {:?} on {}",
            self.config.pin,
            self.config.poll_interval,
            connection.id()
        );
        self.binding = Some(Binding { pin, poll_task });
    }

    fn unbind(&mut self) {
        if let Some(binding) = self.binding.take() {
            binding.poll_task.abort();
            binding.pin.release();
            debug!("[DI] Released pin {}", self.config.pin);
        }
        self.last_value = None;
        self.last_trigger_at = None;
        self.read_error = None;
    }

    fn on_read(&mut self, generation: u64, result: Result<bool, DeviceError>) {
        if self.binding.is_none() || generation != self.generation {
            warn!("[DI] Dropping reading from outdated binding {}", generation);
            return;
        }

        match result {
            Ok(value) => {
                self.read_error = None;
                let policy = self.config.policy;
                if policy.should_emit(self.last_value, value) {
                    self.outbox.emit(NodeEvent::Value(value));
                    self.last_trigger_at = policy.is_trigger().then(Instant::now);
                }
                self.last_value = Some(value);
            }
            Err(e) => {
                if self.read_error.is_none() {
                    error!("[DI] Poll on pin {} failed: {}", self.config.pin, format_chain(&e));
                    self.outbox.report(NodeError::reported(&e));
                } else {
                    debug!("[DI] Poll on pin {} still failing: {}", self.config.pin, e);
                }
                self.read_error = Some(e);
            }
        }

        self.update_status();
    }

    fn update_status(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }

        let status = self.compute_status();
        self.outbox.status(status);
    }

    fn compute_status(&mut self) -> NodeStatus {
        if let Some(status) = link_status(self.connecting, self.connection.is_some()) {
            return status;
        }
        if self.binding.is_none() || self.read_error.is_some() {
            return NodeStatus::Error;
        }

        let hold = Duration::from_millis(timing::TRIGGER_STATUS_HOLD_MS);
        if let Some(left) = hold_remaining(self.last_trigger_at, hold) {
            self.refresh = Some(schedule(left, &self.queue, PollerEvent::StatusRefresh));
            return NodeStatus::Busy;
        }

        NodeStatus::Connected
    }
}

/// Read the pin on every tick until aborted or the poller is gone
async fn poll_pin(
    pin: Arc<dyn DigitalInputPin>,
    period: Duration,
    generation: u64,
    queue: mpsc::UnboundedSender<PollerEvent>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let result = pin.read().await;
        if queue.send(PollerEvent::Read { generation, result }).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::testing::{drain, errors, manager_for, statuses};
    use crate::device::SimulatedReader;
    use tokio::time::sleep;

    fn config(policy: EdgePolicy) -> DigitalInputConfig {
        DigitalInputConfig {
            pin: 2,
            poll_interval: Duration::from_millis(100),
            policy,
        }
    }

    fn values(events: &[NodeEvent]) -> Vec<bool> {
        events
            .iter()
            .filter_map(|event| match event {
                NodeEvent::Value(value) => Some(*value),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_config_validation() {
        assert!(config(EdgePolicy::Read).validate().is_ok());

        let mut bad_pin = config(EdgePolicy::Read);
        bad_pin.pin = 3;
        assert_eq!(bad_pin.validate(), Err(ConfigError::InvalidPin(3)));

        let mut no_interval = config(EdgePolicy::Read);
        no_interval.poll_interval = Duration::ZERO;
        assert!(no_interval.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rising_edge_emits_only_on_transitions() {
        let reader = SimulatedReader::new();
        reader.push_inputs(2, [true, false, true, true, false, true]);
        let manager = manager_for(&reader);
        let (sink, mut rx) = mpsc::unbounded_channel();
        let poller = DigitalInputPoller::spawn(config(EdgePolicy::RisingEdge), &manager, sink)
            .expect("valid config");

        manager.start();
        sleep(Duration::from_secs(2)).await;

        // First reading (true) only sets the baseline
        let events = drain(&mut rx);
        assert_eq!(values(&events), vec![true, true]);
        assert_eq!(reader.claimed_pins(), vec![2]);

        poller.close().await;
        assert!(reader.claimed_pins().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebind_resets_baseline() {
        let reader = SimulatedReader::new();
        reader.set_input(2, true);
        let manager = manager_for(&reader);
        let (sink, mut rx) = mpsc::unbounded_channel();
        let _poller = DigitalInputPoller::spawn(config(EdgePolicy::Change), &manager, sink)
            .expect("valid config");

        manager.start();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(values(&drain(&mut rx)), vec![true]);

        reader.drop_link(DeviceError::new("cable unplugged"));
        sleep(Duration::from_secs(3)).await;

        // New connection, new claim, no previous value
        assert_eq!(values(&drain(&mut rx)), vec![true]);
        assert_eq!(reader.claimed_pins(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_reported_once() {
        let reader = SimulatedReader::new();
        reader.push_input_error(2, DeviceError::wrap("frame", DeviceError::new("checksum")));
        reader.push_input_error(2, DeviceError::new("checksum"));
        reader.push_inputs(2, [true]);
        let manager = manager_for(&reader);
        let (sink, mut rx) = mpsc::unbounded_channel();
        let _poller = DigitalInputPoller::spawn(config(EdgePolicy::Read), &manager, sink)
            .expect("valid config");

        manager.start();
        sleep(Duration::from_millis(550)).await;

        let events = drain(&mut rx);
        assert_eq!(
            errors(&events),
            vec![NodeError::Device(DeviceError::new("checksum"))]
        );
        // Polling continues after the failed ticks
        assert!(values(&events).len() >= 3);
        assert!(statuses(&events).contains(&NodeStatus::Error));
        assert_eq!(statuses(&events).last(), Some(&NodeStatus::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_holds_busy_status() {
        let reader = SimulatedReader::new();
        reader.set_input(2, true);
        let manager = manager_for(&reader);
        let (sink, mut rx) = mpsc::unbounded_channel();
        let _poller = DigitalInputPoller::spawn(config(EdgePolicy::Change), &manager, sink)
            .expect("valid config");

        manager.start();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(
            statuses(&drain(&mut rx)),
            vec![
                NodeStatus::Disconnected,
                NodeStatus::Connecting,
                NodeStatus::Connected,
                NodeStatus::Busy
            ]
        );

        sleep(Duration::from_secs(1)).await;
        assert_eq!(statuses(&drain(&mut rx)), vec![NodeStatus::Connected]);
    }
}
