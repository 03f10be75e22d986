//! Connection manager with a persistent reader connection and automatic reconnection

use super::handle::{Connection, ConnectionId, ConnectionState, StateChange};
use super::registry::{StateCallback, SubscriberRegistry, SubscriptionToken};
use crate::device::{DeviceConnector, DeviceLink, Endpoint, IoLinkParams};
use rfid_shared::limits::{MAX_DEVICE_ID, MAX_PROCESS_DATA_LEN, MAX_VENDOR_ID};
use rfid_shared::state_machine::{LifecycleEvent, LifecycleStateMachine, TransitionResult};
use rfid_shared::{format_chain, timing, ConfigError, DeviceError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Reader address
    pub endpoint: Endpoint,
    /// IO-Link device behind the reader, shared by all cyclic outputs
    pub io_link: IoLinkParams,
    /// Fixed delay between a failure and the next attempt
    pub reconnect_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint {
                host: "127.0.0.1".into(),
                port: 10003,
            },
            io_link: IoLinkParams::new(888, 1, 2, 2),
            reconnect_delay: Duration::from_millis(timing::RECONNECT_DELAY_MS),
            connect_timeout: Duration::from_millis(timing::CONNECT_TIMEOUT_MS),
        }
    }
}

impl ConnectionConfig {
    /// Check address, port and IO-Link identity
    pub fn validate(&self) -> Result<(), ConfigError> {
        let host = self.endpoint.host.trim();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidHost(self.endpoint.host.clone()));
        }
        if self.endpoint.port == 0 {
            return Err(ConfigError::InvalidPort(self.endpoint.port));
        }
        if self.io_link.vendor_id > MAX_VENDOR_ID {
            return Err(ConfigError::InvalidVendorId(self.io_link.vendor_id));
        }
        if self.io_link.device_id > MAX_DEVICE_ID {
            return Err(ConfigError::InvalidDeviceId(self.io_link.device_id));
        }
        for (direction, length) in [
            ("output", self.io_link.output_length),
            ("input", self.io_link.input_length),
        ] {
            if length == 0 || length > MAX_PROCESS_DATA_LEN {
                return Err(ConfigError::InvalidFrameLength { direction, length });
            }
        }
        if self.reconnect_delay.is_zero() {
            return Err(ConfigError::ZeroInterval("reconnect delay"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("connect timeout"));
        }
        Ok(())
    }
}

/// Events processed by the manager task, one at a time
enum ManagerEvent {
    Start,
    AttemptConnected {
        attempt: u64,
        link: Arc<dyn DeviceLink>,
    },
    AttemptFailed {
        attempt: u64,
        error: DeviceError,
    },
    ReconnectDue,
    Close {
        done: oneshot::Sender<()>,
    },
}

type SharedRegistry = Arc<Mutex<SubscriberRegistry>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, SubscriberRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the single reader connection and notifies subscribers of every change
#[derive(Clone)]
pub struct ConnectionManager {
    config: ConnectionConfig,
    event_tx: mpsc::UnboundedSender<ManagerEvent>,
    registry: SharedRegistry,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Validate the configuration and spawn the manager task.
    ///
    /// Nothing is connected until [`start`](Self::start) is called.
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn DeviceConnector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let registry: SharedRegistry = Arc::new(Mutex::new(SubscriberRegistry::new()));

        let task = ManagerTask::new(
            config.clone(),
            connector,
            event_tx.clone(),
            registry.clone(),
            state_tx,
        );
        tokio::spawn(task.run(event_rx));

        Ok(Self {
            config,
            event_tx,
            registry,
            state_rx,
        })
    }

    /// Begin connecting. Calling it again has no effect.
    pub fn start(&self) {
        let _ = self.event_tx.send(ManagerEvent::Start);
    }

    /// Register a state-change callback.
    ///
    /// The callback only sees future changes; query [`state`](Self::state)
    /// for the current one.
    pub fn subscribe<F>(&self, on_state_change: F) -> SubscriptionToken
    where
        F: Fn(&StateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: StateCallback = Arc::new(on_state_change);
        lock(&self.registry).subscribe(callback)
    }

    /// Register a callback and hand it the current state first.
    ///
    /// The registry lock is held while the callback sees the current state,
    /// so no newer change can reach it before that call. The callback must
    /// not subscribe or unsubscribe from within.
    pub fn subscribe_with_state<F>(&self, on_state_change: F) -> SubscriptionToken
    where
        F: Fn(&StateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: StateCallback = Arc::new(on_state_change);
        let mut registry = lock(&self.registry);

        let current = self.state_rx.borrow().as_change();
        if let Err(e) = callback(&current) {
            warn!("[CONN] Subscriber rejected the current state: {:#}", e);
        }
        registry.subscribe(callback)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        lock(&self.registry).unsubscribe(token)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Shut down permanently and wait until the connection is released
    pub async fn close(&self) {
        let (done, done_rx) = oneshot::channel();
        if self.event_tx.send(ManagerEvent::Close { done }).is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct ManagerTask {
    config: ConnectionConfig,
    connector: Arc<dyn DeviceConnector>,
    event_tx: mpsc::UnboundedSender<ManagerEvent>,
    registry: SharedRegistry,
    state_tx: watch::Sender<ConnectionState>,
    fsm: LifecycleStateMachine,
    attempt_seq: u64,
    /// Attempt whose outcome is still honored
    current_attempt: Option<u64>,
    connection: Option<Connection>,
    last_error: Option<DeviceError>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl ManagerTask {
    fn new(
        config: ConnectionConfig,
        connector: Arc<dyn DeviceConnector>,
        event_tx: mpsc::UnboundedSender<ManagerEvent>,
        registry: SharedRegistry,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            config,
            connector,
            event_tx,
            registry,
            state_tx,
            fsm: LifecycleStateMachine::new(),
            attempt_seq: 0,
            current_attempt: None,
            connection: None,
            last_error: None,
            reconnect_timer: None,
        }
    }

    async fn run(mut self, mut event_rx: mpsc::UnboundedReceiver<ManagerEvent>) {
        while let Some(event) = event_rx.recv().await {
            match event {
                ManagerEvent::Start => self.on_start(),
                ManagerEvent::AttemptConnected { attempt, link } => {
                    self.on_connected(attempt, link)
                }
                ManagerEvent::AttemptFailed { attempt, error } => self.on_failed(attempt, error),
                ManagerEvent::ReconnectDue => self.on_reconnect_due(),
                ManagerEvent::Close { done } => {
                    self.on_close();
                    let _ = done.send(());
                    break;
                }
            }
        }

        // Attempts that finished after close are discarded without notification
        event_rx.close();
        while let Ok(event) = event_rx.try_recv() {
            match event {
                ManagerEvent::AttemptConnected { attempt, link } => {
                    debug!(
                        "[CONN] Closing connection of attempt {} established after close",
                        attempt
                    );
                    link.close();
                }
                ManagerEvent::Close { done } => {
                    let _ = done.send(());
                }
                _ => {}
            }
        }
    }

    fn transition(&mut self, event: LifecycleEvent) -> bool {
        match self.fsm.process_event(event) {
            TransitionResult::Success(state) => {
                debug!("[CONN] Lifecycle -> {}", state);
                true
            }
            TransitionResult::Unchanged(state) => {
                debug!("[CONN] {:?} ignored while {}", event, state);
                false
            }
            TransitionResult::Invalid { from, event } => {
                warn!("[CONN] Invalid lifecycle transition: {:?} while {}", event, from);
                false
            }
        }
    }

    fn on_start(&mut self) {
        if self.transition(LifecycleEvent::Start) {
            self.begin_attempt();
        }
    }

    fn on_reconnect_due(&mut self) {
        self.reconnect_timer = None;
        if self.transition(LifecycleEvent::ReconnectDue) {
            self.begin_attempt();
        }
    }

    fn begin_attempt(&mut self) {
        self.attempt_seq += 1;
        let attempt = self.attempt_seq;
        self.current_attempt = Some(attempt);

        info!(
            "[CONN] Connecting to {} via {} (attempt {})",
            self.config.endpoint,
            self.connector.name(),
            attempt
        );

        self.publish(
            ConnectionState::Connecting {
                last_error: self.last_error.clone(),
            },
            StateChange {
                connecting: true,
                connection: None,
                error: self.last_error.clone(),
            },
        );

        tokio::spawn(run_attempt(
            attempt,
            self.connector.clone(),
            self.config.endpoint.clone(),
            self.config.connect_timeout,
            self.event_tx.clone(),
        ));
    }

    fn on_connected(&mut self, attempt: u64, link: Arc<dyn DeviceLink>) {
        if self.current_attempt != Some(attempt) || self.fsm.is_closed() {
            warn!("[CONN] Discarding connection from outdated attempt {}", attempt);
            link.close();
            return;
        }
        if !self.transition(LifecycleEvent::Connected) {
            link.close();
            return;
        }

        let connection = Connection::new(ConnectionId(attempt), link);
        info!("[CONN] Connected to {} ({})", self.config.endpoint, connection.id());

        self.connection = Some(connection.clone());
        self.last_error = None;

        self.publish(
            ConnectionState::Connected(connection.clone()),
            StateChange {
                connecting: false,
                connection: Some(connection),
                error: None,
            },
        );
    }

    fn on_failed(&mut self, attempt: u64, error: DeviceError) {
        if self.current_attempt != Some(attempt) {
            warn!(
                "[CONN] Ignoring outdated connection error from attempt {}: {}",
                attempt, error
            );
            return;
        }
        if !self.transition(LifecycleEvent::ConnectFailed) {
            return;
        }

        error!(
            "[CONN] Connection error ({} in a row): {}",
            self.fsm.failures_in_a_row(),
            format_chain(&error)
        );

        self.current_attempt = None;
        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
        self.last_error = Some(error.clone());

        self.publish(
            ConnectionState::Disconnected(error.clone()),
            StateChange {
                connecting: false,
                connection: None,
                error: Some(error),
            },
        );

        let delay = self.config.reconnect_delay;
        let event_tx = self.event_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = event_tx.send(ManagerEvent::ReconnectDue);
        }));
    }

    fn on_close(&mut self) {
        if !self.transition(LifecycleEvent::Close) {
            return;
        }
        info!("[CONN] Closing connection manager");

        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.current_attempt = None;
        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
        self.state_tx.send_replace(ConnectionState::Closed);
    }

    /// Record the new state, then fan out to a snapshot of the subscribers
    fn publish(&self, state: ConnectionState, change: StateChange) {
        // State and snapshot change together under the registry lock, so a
        // subscriber seeded with the old state is always in the snapshot
        let snapshot = {
            let registry = lock(&self.registry);
            self.state_tx.send_replace(state);
            registry.snapshot()
        };
        snapshot.notify(&change);
    }
}

/// One connect attempt: reports the outcome, then watches the link until it ends
async fn run_attempt(
    attempt: u64,
    connector: Arc<dyn DeviceConnector>,
    endpoint: Endpoint,
    connect_timeout: Duration,
    event_tx: mpsc::UnboundedSender<ManagerEvent>,
) {
    let link = match timeout(connect_timeout, connector.connect(&endpoint)).await {
        Ok(Ok(link)) => link,
        Ok(Err(error)) => {
            let _ = event_tx.send(ManagerEvent::AttemptFailed { attempt, error });
            return;
        }
        Err(_) => {
            let error = DeviceError::new(format!("connect to {} timed out", endpoint));
            let _ = event_tx.send(ManagerEvent::AttemptFailed { attempt, error });
            return;
        }
    };

    let connected = ManagerEvent::AttemptConnected {
        attempt,
        link: link.clone(),
    };
    if event_tx.send(connected).is_err() {
        // Manager already closed
        link.close();
        return;
    }

    let error = link.closed().await;
    let _ = event_tx.send(ManagerEvent::AttemptFailed { attempt, error });
}
