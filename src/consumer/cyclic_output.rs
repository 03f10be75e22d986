//! Debounced IO-Link cyclic output writer
//!
//! Holds at most one pending payload. A new input overwrites it, and it is
//! flushed once no write is in flight and the debounce window after the
//! previous write has elapsed.

use super::{attach, detach, hold_remaining, link_status, schedule, EventSink, Outbox};
use crate::connection::{Connection, ConnectionManager, StateChange, SubscriptionToken};
use crate::device::{IoLinkParams, IoLinkSession};
use bytes::Bytes;
use rfid_shared::{format_chain, timing, ConfigError, DeviceError, NodeError, NodeStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclicOutputConfig {
    /// Minimum spacing between completed writes; zero is allowed
    pub debounce: Duration,
}

enum WriterEvent {
    StateChanged(StateChange),
    Input(Bytes),
    WriteDone {
        generation: u64,
        result: Result<(), DeviceError>,
    },
    DebounceElapsed(u64),
    StatusRefresh,
    Close(oneshot::Sender<()>),
}

/// Handle to a running cyclic output writer
pub struct CyclicOutputWriter {
    manager: ConnectionManager,
    token: SubscriptionToken,
    queue: mpsc::UnboundedSender<WriterEvent>,
}

impl CyclicOutputWriter {
    /// The IO-Link device identity and frame lengths come from the manager
    pub fn spawn(
        config: CyclicOutputConfig,
        manager: &ConnectionManager,
        sink: EventSink,
    ) -> Result<Self, ConfigError> {
        manager.config().validate()?;

        let (queue, events) = mpsc::unbounded_channel();
        let task = WriterTask {
            config,
            io_link: manager.config().io_link,
            queue: queue.clone(),
            outbox: Outbox::new(sink),
            connecting: false,
            connection: None,
            session: None,
            generation: 0,
            pending: None,
            writing: false,
            last_write_at: None,
            last_error: None,
            reported_error: None,
            debounce: None,
            debounce_seq: 0,
            not_connected_reported: false,
            refresh: None,
        };
        tokio::spawn(task.run(events));

        let token = attach(manager, &queue, WriterEvent::StateChanged);
        Ok(Self {
            manager: manager.clone(),
            token,
            queue,
        })
    }

    /// Queue a process data payload for writing
    pub fn input(&self, payload: impl Into<Bytes>) {
        let _ = self.queue.send(WriterEvent::Input(payload.into()));
    }

    /// Drop any pending payload and release the IO-Link session
    pub async fn close(&self) {
        detach(&self.manager, self.token, &self.queue, WriterEvent::Close).await;
    }
}

struct WriterTask {
    config: CyclicOutputConfig,
    io_link: IoLinkParams,
    queue: mpsc::UnboundedSender<WriterEvent>,
    outbox: Outbox,
    connecting: bool,
    connection: Option<Connection>,
    session: Option<Arc<dyn IoLinkSession>>,
    generation: u64,
    pending: Option<Bytes>,
    writing: bool,
    last_write_at: Option<Instant>,
    last_error: Option<DeviceError>,
    /// Root message of the last reported write error
    reported_error: Option<String>,
    debounce: Option<JoinHandle<()>>,
    debounce_seq: u64,
    not_connected_reported: bool,
    refresh: Option<JoinHandle<()>>,
}

impl WriterTask {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<WriterEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                WriterEvent::StateChanged(change) => self.on_state_change(change),
                WriterEvent::Input(payload) => self.on_input(payload),
                WriterEvent::WriteDone { generation, result } => {
                    self.on_write_done(generation, result)
                }
                WriterEvent::DebounceElapsed(seq) => {
                    if seq == self.debounce_seq && self.debounce.take().is_some() {
                        self.flush();
                        self.update_status();
                    }
                }
                WriterEvent::StatusRefresh => {
                    self.refresh = None;
                    self.update_status();
                }
                WriterEvent::Close(done) => {
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
        match connection.claim_io_link(&self.io_link) {
            Ok(session) => {
                self.generation += 1;
                self.session = Some(session);
                self.not_connected_reported = false;
                info!(
                    "[IOL] Claimed IO-Link device {}/{} on {}",
                    self.io_link.vendor_id,
                    self.io_link.device_id,
                    connection.id()
                );
            }
            Err(e) => {
                error!("[IOL] Claiming IO-Link device failed: {}", format_chain(&e));
                self.outbox.report(NodeError::reported(&e));
                self.last_error = Some(e);
            }
        }
    }

    fn unbind(&mut self) {
        if let Some(session) = self.session.take() {
            session.release();
            debug!("[IOL] Released IO-Link session");
        }
        if self.pending.take().is_some() {
            debug!("[IOL] Discarded pending payload");
        }
        if let Some(debounce) = self.debounce.take() {
            debounce.abort();
        }
        self.last_error = None;
        self.reported_error = None;
        self.last_write_at = None;
    }

    fn on_input(&mut self, payload: Bytes) {
        if self.session.is_none() {
            if !self.not_connected_reported {
                warn!(
                    "[IOL] Not connected, further inputs are dropped silently until connected again"
                );
                self.outbox.report(NodeError::NotConnected);
                self.not_connected_reported = true;
            }
            return;
        }
        self.not_connected_reported = false;

        let expected = self.io_link.output_length;
        if payload.len() != expected {
            self.outbox.report(NodeError::InvalidPayloadLength {
                expected,
                actual: payload.len(),
            });
            return;
        }

        if self.pending.replace(payload).is_some() {
            debug!("[IOL] Superseded unsent payload");
        }
        self.flush();
    }

    fn flush(&mut self) {
        if self.writing || self.debounce.is_some() {
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        let Some(data) = self.pending.take() else {
            return;
        };

        self.writing = true;
        self.last_write_at = Some(Instant::now());
        self.last_error = None;

        let generation = self.generation;
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let result = session.write_cyclic_process_data(0, data).await;
            let _ = queue.send(WriterEvent::WriteDone { generation, result });
        });

        self.update_status();
    }

    fn on_write_done(&mut self, generation: u64, result: Result<(), DeviceError>) {
        self.writing = false;

        if generation == self.generation && self.session.is_some() {
            match result {
                Ok(()) => self.reported_error = None,
                Err(e) => {
                    let root = e.root_cause().message().to_string();
                    if self.reported_error.as_deref() != Some(root.as_str()) {
                        error!("[IOL] Writing process data failed: {}", format_chain(&e));
                        self.outbox.report(NodeError::reported(&e));
                        self.reported_error = Some(root);
                    } else {
                        debug!("[IOL] Writing process data failed again: {}", e);
                    }
                    self.last_error = Some(e);
                }
            }
        } else {
            debug!("[IOL] Write from released session {} completed", generation);
        }

        self.debounce_seq += 1;
        self.debounce = Some(schedule(
            self.config.debounce,
            &self.queue,
            WriterEvent::DebounceElapsed(self.debounce_seq),
        ));

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
        if self.last_error.is_some() {
            return NodeStatus::Error;
        }
        if self.writing {
            return NodeStatus::Busy;
        }

        let hold = Duration::from_millis(timing::WRITE_STATUS_HOLD_MS);
        if let Some(left) = hold_remaining(self.last_write_at, hold) {
            self.refresh = Some(schedule(left, &self.queue, WriterEvent::StatusRefresh));
            return NodeStatus::Busy;
        }

        NodeStatus::Connected
    }
}
