//! Carrier scanner
//!
//! Either a one-shot detect per trigger, or a continuous device-driven scan
//! started and stopped by the host. Continuous scan results are tagged with
//! the run that produced them; results of a superseded run are discarded.

use super::{attach, detach, EventSink, Outbox};
use crate::connection::{Connection, ConnectionManager, StateChange, SubscriptionToken};
use crate::device::{CarrierStream, DetectRequest, ScanRequest};
use futures::StreamExt;
use rfid_shared::timing::MAX_CARRIERS_PER_REQUEST;
use rfid_shared::{
    format_chain, Carrier, ConfigError, DetectMode, DeviceError, NodeError, NodeEvent, NodeStatus,
    TagField,
};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerMode {
    /// Bounded scan on every trigger
    Detect { mode: DetectMode, scan_time: Duration },
    /// Device-driven scan between `start` and `stop`
    Continuous {
        poll_interval: Duration,
        /// Forward each tag identity only once per run
        dedup: bool,
        /// Forward batches without carriers
        emit_empty: bool,
        /// Requested page size; the device is always asked for the fixed maximum
        page_size: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannerConfig {
    pub field: TagField,
    pub mode: ScannerMode,
}

impl ScannerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            ScannerMode::Detect { scan_time, .. } if scan_time.is_zero() => {
                Err(ConfigError::ZeroInterval("scan time"))
            }
            ScannerMode::Continuous { poll_interval, .. } if poll_interval.is_zero() => {
                Err(ConfigError::ZeroInterval("poll interval"))
            }
            _ => Ok(()),
        }
    }
}

/// Host commands accepted by a scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCommand {
    /// One-shot detect
    Trigger,
    /// Begin a continuous scan
    Start,
    /// End the continuous scan
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ScanHandleId(u64);

impl fmt::Display for ScanHandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan-{}", self.0)
    }
}

/// What to do with a batch delivered by a continuous scan
#[derive(Debug, PartialEq)]
enum Batch {
    /// Produced by a run that is no longer current
    Stale,
    /// Nothing left to forward
    Dropped,
    Forward(Vec<Carrier>),
}

/// Bookkeeping of continuous scan runs
struct ScanRun {
    next_handle: u64,
    current: Option<ScanHandleId>,
    seen: HashSet<String>,
    field: TagField,
    dedup: bool,
    emit_empty: bool,
}

impl ScanRun {
    fn new(field: TagField, dedup: bool, emit_empty: bool) -> Self {
        Self {
            next_handle: 0,
            current: None,
            seen: HashSet::new(),
            field,
            dedup,
            emit_empty,
        }
    }

    /// Start a new run, superseding any previous one
    fn begin(&mut self) -> ScanHandleId {
        self.seen.clear();
        self.next_handle += 1;
        let handle = ScanHandleId(self.next_handle);
        self.current = Some(handle);
        handle
    }

    fn end(&mut self) -> Option<ScanHandleId> {
        self.seen.clear();
        self.current.take()
    }

    fn is_active(&self) -> bool {
        self.current.is_some()
    }

    fn is_current(&self, handle: ScanHandleId) -> bool {
        self.current == Some(handle)
    }

    fn accept(&mut self, handle: ScanHandleId, carriers: Vec<Carrier>) -> Batch {
        if !self.is_current(handle) {
            return Batch::Stale;
        }

        let carriers = if self.dedup {
            let field = self.field;
            let seen = &mut self.seen;
            carriers
                .into_iter()
                .filter(|carrier| seen.insert(carrier.identity(field)))
                .collect()
        } else {
            carriers
        };

        if carriers.is_empty() && !self.emit_empty {
            Batch::Dropped
        } else {
            Batch::Forward(carriers)
        }
    }
}

enum ScannerEvent {
    StateChanged(StateChange),
    Command(ScanCommand),
    DetectDone(Result<Vec<Carrier>, DeviceError>),
    Batch {
        handle: ScanHandleId,
        /// `None` once the device stream has ended
        item: Option<Result<Vec<Carrier>, DeviceError>>,
    },
    Close(oneshot::Sender<()>),
}

/// Handle to a running carrier scanner
pub struct CarrierScanner {
    manager: ConnectionManager,
    token: SubscriptionToken,
    queue: mpsc::UnboundedSender<ScannerEvent>,
    mode: ScannerMode,
}

impl CarrierScanner {
    pub fn spawn(
        config: ScannerConfig,
        manager: &ConnectionManager,
        sink: EventSink,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let outbox = Outbox::new(sink);
        let run = match config.mode {
            ScannerMode::Continuous {
                dedup,
                emit_empty,
                page_size,
                ..
            } => {
                if page_size != MAX_CARRIERS_PER_REQUEST {
                    let notice = format!(
                        "max carriers per request is fixed from {} to {}",
                        page_size, MAX_CARRIERS_PER_REQUEST
                    );
                    warn!("[SCAN] {}", notice);
                    outbox.emit(NodeEvent::Warning(notice));
                }
                ScanRun::new(config.field, dedup, emit_empty)
            }
            ScannerMode::Detect { .. } => ScanRun::new(config.field, false, false),
        };

        let (queue, events) = mpsc::unbounded_channel();
        let task = ScannerTask {
            config,
            queue: queue.clone(),
            outbox,
            connection: None,
            detecting: None,
            scan_run: run,
            forwarder: None,
            last_error: false,
        };
        tokio::spawn(task.run(events));

        let token = attach(manager, &queue, ScannerEvent::StateChanged);
        Ok(Self {
            manager: manager.clone(),
            token,
            queue,
            mode: config.mode,
        })
    }

    pub fn command(&self, command: ScanCommand) {
        let _ = self.queue.send(ScannerEvent::Command(command));
    }

    /// Map a host message payload onto a command.
    ///
    /// A detect scanner triggers on any payload; a continuous scanner starts
    /// on `true`, stops on `false` and ignores everything else.
    pub fn input(&self, payload: &serde_json::Value) {
        let command = match (self.mode, payload) {
            (ScannerMode::Detect { .. }, _) => ScanCommand::Trigger,
            (ScannerMode::Continuous { .. }, serde_json::Value::Bool(true)) => ScanCommand::Start,
            (ScannerMode::Continuous { .. }, serde_json::Value::Bool(false)) => ScanCommand::Stop,
            (ScannerMode::Continuous { .. }, other) => {
                debug!("[SCAN] Ignoring payload {}", other);
                return;
            }
        };
        self.command(command);
    }

    /// Stop any scan and discard outstanding results
    pub async fn close(&self) {
        detach(&self.manager, self.token, &self.queue, ScannerEvent::Close).await;
    }
}

struct ScannerTask {
    config: ScannerConfig,
    queue: mpsc::UnboundedSender<ScannerEvent>,
    outbox: Outbox,
    connection: Option<Connection>,
    detecting: Option<JoinHandle<()>>,
    scan_run: ScanRun,
    forwarder: Option<JoinHandle<()>>,
    last_error: bool,
}

impl ScannerTask {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ScannerEvent>) {
        self.update_status();

        while let Some(event) = events.recv().await {
            match event {
                ScannerEvent::StateChanged(change) => self.connection = change.connection,
                ScannerEvent::Command(command) => self.on_command(command),
                ScannerEvent::DetectDone(result) => self.on_detect_done(result),
                ScannerEvent::Batch { handle, item } => self.on_batch(handle, item),
                ScannerEvent::Close(done) => {
                    if let Some(detect) = self.detecting.take() {
                        detect.abort();
                    }
                    self.end_run();
                    let _ = done.send(());
                    break;
                }
            }
        }
    }

    fn on_command(&mut self, command: ScanCommand) {
        match (command, self.config.mode) {
            (ScanCommand::Trigger, ScannerMode::Detect { mode, scan_time }) => {
                self.detect(DetectRequest {
                    field: self.config.field,
                    scan_time,
                    mode,
                })
            }
            (ScanCommand::Start, ScannerMode::Continuous { poll_interval, .. }) => {
                self.start(ScanRequest {
                    field: self.config.field,
                    page_size: MAX_CARRIERS_PER_REQUEST,
                    interval: poll_interval,
                })
            }
            (ScanCommand::Stop, ScannerMode::Continuous { .. }) => self.stop(),
            (command, mode) => debug!("[SCAN] {:?} not supported in {:?}", command, mode),
        }
    }

    fn fail(&mut self, error: NodeError) {
        self.outbox.report(error);
        self.last_error = true;
        self.update_status();
    }

    /// Busy rejections leave the status alone
    fn reject(&self, error: NodeError) {
        warn!("[SCAN] {}", error);
        self.outbox.report(error);
    }

    fn detect(&mut self, request: DetectRequest) {
        let Some(connection) = self.connection.clone() else {
            self.fail(NodeError::NotConnected);
            return;
        };
        if self.detecting.is_some() {
            self.reject(NodeError::DetectInProgress);
            return;
        }

        debug!("[SCAN] Detecting {} for {:?}", request.field, request.scan_time);
        let queue = self.queue.clone();
        self.detecting = Some(tokio::spawn(async move {
            let result = connection.detect_carriers_once(request).await;
            let _ = queue.send(ScannerEvent::DetectDone(result));
        }));
        self.last_error = false;
        self.update_status();
    }

    fn on_detect_done(&mut self, result: Result<Vec<Carrier>, DeviceError>) {
        if self.detecting.take().is_none() {
            return;
        }

        match result {
            Ok(carriers) => {
                debug!("[SCAN] Detected {} carriers", carriers.len());
                self.outbox.emit(NodeEvent::Carriers(carriers));
            }
            Err(e) => {
                error!("[SCAN] Scanning failed: {}", format_chain(&e));
                self.outbox.report(NodeError::reported(&e));
                self.last_error = true;
            }
        }
        self.update_status();
    }

    fn start(&mut self, request: ScanRequest) {
        if self.scan_run.is_active() {
            self.reject(NodeError::ScanAlreadyStarted);
            return;
        }
        let Some(connection) = self.connection.clone() else {
            self.fail(NodeError::NotConnected);
            return;
        };

        let stream = match connection.scan_carriers_continuous(request) {
            Ok(stream) => stream,
            Err(e) => {
                error!("[SCAN] Starting scan failed: {}", format_chain(&e));
                self.fail(NodeError::reported(&e));
                return;
            }
        };

        let handle = self.scan_run.begin();
        info!(
            "[SCAN] Started {} on {} ({} every {:?})",
            handle,
            connection.id(),
            request.field,
            request.interval
        );
        self.forwarder = Some(tokio::spawn(forward_batches(
            handle,
            stream,
            self.queue.clone(),
        )));
        self.last_error = false;
        self.update_status();
    }

    fn stop(&mut self) {
        if !self.scan_run.is_active() {
            self.reject(NodeError::ScanNotStarted);
            // A run that ended on a stream error still clears its error on stop
            if self.last_error {
                self.last_error = false;
                self.update_status();
            }
            return;
        }

        self.end_run();
        self.last_error = false;
        self.update_status();
    }

    /// Release the current run, if any; dropping the stream stops the device scan
    fn end_run(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(handle) = self.scan_run.end() {
            info!("[SCAN] Stopped {}", handle);
        }
    }

    fn on_batch(
        &mut self,
        handle: ScanHandleId,
        item: Option<Result<Vec<Carrier>, DeviceError>>,
    ) {
        let error = match item {
            Some(Ok(carriers)) => {
                match self.scan_run.accept(handle, carriers) {
                    Batch::Forward(carriers) => self.outbox.emit(NodeEvent::Carriers(carriers)),
                    Batch::Dropped => {}
                    Batch::Stale => warn!("[SCAN] Discarding batch from outdated {}", handle),
                }
                return;
            }
            Some(Err(e)) => e,
            None => DeviceError::new("carrier scan ended"),
        };

        if !self.scan_run.is_current(handle) {
            warn!("[SCAN] Discarding failure of outdated {}: {}", handle, error);
            return;
        }

        error!("[SCAN] {} failed: {}", handle, format_chain(&error));
        self.end_run();
        self.fail(NodeError::reported(&error));
    }

    fn update_status(&mut self) {
        let status = if self.last_error {
            NodeStatus::Error
        } else if self.detecting.is_some() || self.scan_run.is_active() {
            NodeStatus::Busy
        } else {
            NodeStatus::Idle
        };
        self.outbox.status(status);
    }
}

/// Pump a device stream into the scanner queue until it fails or ends
async fn forward_batches(
    handle: ScanHandleId,
    mut stream: CarrierStream,
    queue: mpsc::UnboundedSender<ScannerEvent>,
) {
    while let Some(item) = stream.next().await {
        let failed = item.is_err();
        if queue
            .send(ScannerEvent::Batch {
                handle,
                item: Some(item),
            })
            .is_err()
            || failed
        {
            return;
        }
    }
    let _ = queue.send(ScannerEvent::Batch { handle, item: None });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::testing::{drain, errors, manager_for, statuses};
    use crate::device::SimulatedReader;
    use tokio::time::sleep;

    fn carrier(epc: &[u8]) -> Carrier {
        Carrier::new(epc.to_vec(), vec![0xE2, 0x00])
    }

    fn carriers(events: &[NodeEvent]) -> Vec<Vec<Carrier>> {
        events
            .iter()
            .filter_map(|event| match event {
                NodeEvent::Carriers(carriers) => Some(carriers.clone()),
                _ => None,
            })
            .collect()
    }

    fn continuous(page_size: u32, dedup: bool) -> ScannerConfig {
        ScannerConfig {
            field: TagField::EpcBinary,
            mode: ScannerMode::Continuous {
                poll_interval: Duration::from_millis(200),
                dedup,
                emit_empty: false,
                page_size,
            },
        }
    }

    fn detect() -> ScannerConfig {
        ScannerConfig {
            field: TagField::TidBinary,
            mode: ScannerMode::Detect {
                mode: DetectMode::Cumulated,
                scan_time: Duration::from_millis(500),
            },
        }
    }

    #[test]
    fn test_dedup_forwards_first_sighting_only() {
        let mut run = ScanRun::new(TagField::EpcBinary, true, false);
        let handle = run.begin();

        let abcd = carrier(&[0xAB, 0xCD]);
        assert_eq!(
            run.accept(handle, vec![abcd.clone()]),
            Batch::Forward(vec![abcd.clone()])
        );
        assert_eq!(run.accept(handle, vec![abcd.clone()]), Batch::Dropped);

        // Mixed batch keeps only the unseen carrier
        let beef = carrier(&[0xBE, 0xEF]);
        assert_eq!(
            run.accept(handle, vec![abcd.clone(), beef.clone()]),
            Batch::Forward(vec![beef])
        );

        // A new run forgets what was seen
        run.end();
        let next = run.begin();
        assert_eq!(run.accept(next, vec![abcd.clone()]), Batch::Forward(vec![abcd]));
    }

    #[test]
    fn test_late_batch_from_stopped_run_is_stale() {
        let mut run = ScanRun::new(TagField::EpcBinary, false, false);
        let first = run.begin();
        run.end();
        let second = run.begin();

        assert!(!run.is_current(first));
        assert_eq!(run.accept(first, vec![carrier(&[1])]), Batch::Stale);
        assert_eq!(
            run.accept(second, vec![carrier(&[2])]),
            Batch::Forward(vec![carrier(&[2])])
        );
    }

    #[test]
    fn test_empty_batches() {
        let mut quiet = ScanRun::new(TagField::EpcBinary, false, false);
        let handle = quiet.begin();
        assert_eq!(quiet.accept(handle, Vec::new()), Batch::Dropped);

        let mut chatty = ScanRun::new(TagField::EpcBinary, false, true);
        let handle = chatty.begin();
        assert_eq!(chatty.accept(handle, Vec::new()), Batch::Forward(Vec::new()));
    }

    #[test]
    fn test_config_validation() {
        assert!(detect().validate().is_ok());

        let zero = ScannerConfig {
            field: TagField::EpcBinary,
            mode: ScannerMode::Detect {
                mode: DetectMode::Live,
                scan_time: Duration::ZERO,
            },
        };
        assert_eq!(zero.validate(), Err(ConfigError::ZeroInterval("scan time")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_while_busy_is_rejected() {
        let reader = SimulatedReader::new();
        let found = vec![carrier(&[0xAB, 0xCD])];
        reader.push_detect_result(Ok(found.clone()));
        let manager = manager_for(&reader);
        manager.start();
        sleep(Duration::from_millis(10)).await;

        let (sink, mut rx) = mpsc::unbounded_channel();
        let scanner = CarrierScanner::spawn(detect(), &manager, sink).expect("valid config");
        scanner.input(&serde_json::json!({"any": "payload"}));
        scanner.command(ScanCommand::Trigger);
        sleep(Duration::from_millis(100)).await;

        let events = drain(&mut rx);
        assert_eq!(errors(&events), vec![NodeError::DetectInProgress]);
        assert_eq!(statuses(&events), vec![NodeStatus::Idle, NodeStatus::Busy]);

        sleep(Duration::from_millis(500)).await;
        let events = drain(&mut rx);
        assert_eq!(carriers(&events), vec![found]);
        assert_eq!(statuses(&events), vec![NodeStatus::Idle]);

        let requests = reader.detect_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].mode, DetectMode::Cumulated);
        assert_eq!(requests[0].field, TagField::TidBinary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_without_connection() {
        let reader = SimulatedReader::new();
        let manager = manager_for(&reader);
        let (sink, mut rx) = mpsc::unbounded_channel();
        let scanner = CarrierScanner::spawn(detect(), &manager, sink).expect("valid config");

        scanner.command(ScanCommand::Trigger);
        sleep(Duration::from_millis(10)).await;

        let events = drain(&mut rx);
        assert_eq!(errors(&events), vec![NodeError::NotConnected]);
        assert_eq!(statuses(&events), vec![NodeStatus::Idle, NodeStatus::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_result_discarded_after_close() {
        let reader = SimulatedReader::new();
        reader.push_detect_result(Ok(vec![carrier(&[1])]));
        let manager = manager_for(&reader);
        manager.start();
        sleep(Duration::from_millis(10)).await;

        let (sink, mut rx) = mpsc::unbounded_channel();
        let scanner = CarrierScanner::spawn(detect(), &manager, sink).expect("valid config");
        scanner.command(ScanCommand::Trigger);
        sleep(Duration::from_millis(100)).await;

        scanner.close().await;
        sleep(Duration::from_secs(1)).await;
        assert!(carriers(&drain(&mut rx)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_size_is_clamped_with_warning() {
        let reader = SimulatedReader::new();
        let manager = manager_for(&reader);
        manager.start();
        sleep(Duration::from_millis(10)).await;

        let (sink, mut rx) = mpsc::unbounded_channel();
        let scanner =
            CarrierScanner::spawn(continuous(100, false), &manager, sink).expect("valid config");
        scanner.input(&serde_json::Value::Bool(true));
        sleep(Duration::from_millis(10)).await;

        let events = drain(&mut rx);
        assert_eq!(
            events.first(),
            Some(&NodeEvent::Warning(
                "max carriers per request is fixed from 100 to 999".into()
            ))
        );
        let requests = reader.scan_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].page_size, 999);
        assert_eq!(requests[0].interval, Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_scan_dedup() {
        let reader = SimulatedReader::new();
        let manager = manager_for(&reader);
        manager.start();
        sleep(Duration::from_millis(10)).await;

        let (sink, mut rx) = mpsc::unbounded_channel();
        let scanner =
            CarrierScanner::spawn(continuous(999, true), &manager, sink).expect("valid config");
        scanner.command(ScanCommand::Start);
        sleep(Duration::from_millis(10)).await;

        let abcd = carrier(&[0xAB, 0xCD]);
        assert_eq!(reader.emit_scan(vec![abcd.clone()]), 1);
        assert_eq!(reader.emit_scan(vec![abcd.clone()]), 1);
        sleep(Duration::from_millis(10)).await;

        let events = drain(&mut rx);
        assert_eq!(carriers(&events), vec![vec![abcd]]);
        assert_eq!(statuses(&events), vec![NodeStatus::Idle, NodeStatus::Busy]);
        assert!(events.iter().all(|e| !matches!(e, NodeEvent::Warning(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_rejections() {
        let reader = SimulatedReader::new();
        let manager = manager_for(&reader);
        manager.start();
        sleep(Duration::from_millis(10)).await;

        let (sink, mut rx) = mpsc::unbounded_channel();
        let scanner =
            CarrierScanner::spawn(continuous(999, false), &manager, sink).expect("valid config");
        scanner.command(ScanCommand::Stop);
        scanner.command(ScanCommand::Start);
        scanner.command(ScanCommand::Start);
        scanner.command(ScanCommand::Stop);
        sleep(Duration::from_millis(10)).await;

        let events = drain(&mut rx);
        assert_eq!(
            errors(&events),
            vec![NodeError::ScanNotStarted, NodeError::ScanAlreadyStarted]
        );
        assert_eq!(
            statuses(&events),
            vec![NodeStatus::Idle, NodeStatus::Busy, NodeStatus::Idle]
        );
        assert_eq!(reader.scan_requests().len(), 1);
        assert_eq!(reader.active_scans(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_ends_run_with_root_cause() {
        let reader = SimulatedReader::new();
        let manager = manager_for(&reader);
        manager.start();
        sleep(Duration::from_millis(10)).await;

        let (sink, mut rx) = mpsc::unbounded_channel();
        let scanner =
            CarrierScanner::spawn(continuous(999, false), &manager, sink).expect("valid config");
        scanner.command(ScanCommand::Start);
        sleep(Duration::from_millis(10)).await;

        reader.fail_scans(DeviceError::wrap("page request", DeviceError::new("antenna fault")));
        sleep(Duration::from_millis(10)).await;

        let events = drain(&mut rx);
        assert_eq!(
            errors(&events),
            vec![NodeError::Device(DeviceError::new("antenna fault"))]
        );
        assert_eq!(statuses(&events).last(), Some(&NodeStatus::Error));

        // Run is over, so a new start is accepted
        scanner.command(ScanCommand::Start);
        sleep(Duration::from_millis(10)).await;
        assert!(errors(&drain(&mut rx)).is_empty());
        assert_eq!(reader.scan_requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_stream_error_clears_error() {
        let reader = SimulatedReader::new();
        let manager = manager_for(&reader);
        manager.start();
        sleep(Duration::from_millis(10)).await;

        let (sink, mut rx) = mpsc::unbounded_channel();
        let scanner =
            CarrierScanner::spawn(continuous(999, false), &manager, sink).expect("valid config");
        scanner.command(ScanCommand::Start);
        sleep(Duration::from_millis(10)).await;
        reader.fail_scans(DeviceError::new("antenna fault"));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(statuses(&drain(&mut rx)).last(), Some(&NodeStatus::Error));

        scanner.command(ScanCommand::Stop);
        sleep(Duration::from_millis(10)).await;

        let events = drain(&mut rx);
        assert_eq!(errors(&events), vec![NodeError::ScanNotStarted]);
        assert_eq!(statuses(&events), vec![NodeStatus::Idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outdated_run_events_are_discarded() {
        let reader = SimulatedReader::new();
        let manager = manager_for(&reader);
        manager.start();
        sleep(Duration::from_millis(10)).await;

        let (sink, mut rx) = mpsc::unbounded_channel();
        let scanner =
            CarrierScanner::spawn(continuous(999, false), &manager, sink).expect("valid config");
        scanner.command(ScanCommand::Start);
        scanner.command(ScanCommand::Stop);
        scanner.command(ScanCommand::Start);
        sleep(Duration::from_millis(10)).await;
        drain(&mut rx);

        // The first run was scan-1; its late batch, failure and end are all ignored
        let first = ScanHandleId(1);
        for item in [
            Some(Ok(vec![carrier(&[1])])),
            Some(Err(DeviceError::new("late fault"))),
            None,
        ] {
            assert!(scanner
                .queue
                .send(ScannerEvent::Batch {
                    handle: first,
                    item
                })
                .is_ok());
        }
        sleep(Duration::from_millis(10)).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(reader.active_scans(), 1);

        let current = carrier(&[2]);
        assert_eq!(reader.emit_scan(vec![current.clone()]), 1);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(carriers(&drain(&mut rx)), vec![vec![current]]);
    }
}
