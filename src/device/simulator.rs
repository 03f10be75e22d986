//! Simulated reader
//!
//! Implements the device traits in memory. Every behavior can be scripted
//! (connect failures, pin levels, write latency, scan batches) and every
//! interaction is recorded, so the same backend drives `main` and the tests.

use super::traits::{
    CarrierStream, DetectRequest, DeviceConnector, DeviceLink, DigitalInputPin, Endpoint,
    IoLinkParams, IoLinkSession, ScanRequest,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as feed;
use futures::StreamExt;
use rfid_shared::{Carrier, DeviceError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

type LinkLoss = watch::Sender<Option<DeviceError>>;
type ScanItem = Result<Vec<Carrier>, DeviceError>;

/// A process data write that reached the simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    /// Completion time of the write
    pub at: Instant,
    pub offset: usize,
    pub data: Bytes,
}

struct ScanFeed {
    tx: feed::UnboundedSender<ScanItem>,
}

#[derive(Default)]
struct ReaderState {
    connect_failures: VecDeque<DeviceError>,
    connect_attempts: Vec<Instant>,
    connect_delay: Duration,
    links: Vec<Arc<LinkLoss>>,

    input_queue: HashMap<u8, VecDeque<Result<bool, DeviceError>>>,
    input_level: HashMap<u8, bool>,
    claimed_pins: Vec<u8>,

    io_link_claims: usize,
    write_delay: Duration,
    write_failures: VecDeque<DeviceError>,
    writes_in_flight: usize,
    max_writes_in_flight: usize,
    writes: Vec<RecordedWrite>,

    detect_results: VecDeque<ScanItem>,
    detect_requests: Vec<DetectRequest>,
    scans: Vec<ScanFeed>,
    scan_log: Vec<ScanRequest>,
}

fn lock(state: &Mutex<ReaderState>) -> MutexGuard<'_, ReaderState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory reader implementing [`DeviceConnector`]
#[derive(Clone, Default)]
pub struct SimulatedReader {
    state: Arc<Mutex<ReaderState>>,
}

impl SimulatedReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next connect attempts fail with these errors, in order
    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = DeviceError>) {
        lock(&self.state).connect_failures.extend(errors);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state).connect_delay = delay;
    }

    /// Start time of every connect attempt so far
    pub fn connect_attempts(&self) -> Vec<Instant> {
        lock(&self.state).connect_attempts.clone()
    }

    /// Number of links that are neither closed nor lost
    pub fn live_links(&self) -> usize {
        lock(&self.state)
            .links
            .iter()
            .filter(|loss| loss.borrow().is_none())
            .count()
    }

    /// Simulate loss of the most recent live link
    pub fn drop_link(&self, error: DeviceError) {
        let mut state = lock(&self.state);
        if let Some(loss) = state.links.iter().rev().find(|loss| loss.borrow().is_none()) {
            loss.send_replace(Some(error.clone()));
        }
        for scan in state.scans.iter() {
            let _ = scan
                .tx
                .unbounded_send(Err(DeviceError::wrap("scan aborted", error.clone())));
        }
        state.scans.retain(|scan| !scan.tx.is_closed());
    }

    /// Queue readings for a pin; once drained the pin keeps its last level
    pub fn push_inputs(&self, pin: u8, values: impl IntoIterator<Item = bool>) {
        lock(&self.state)
            .input_queue
            .entry(pin)
            .or_default()
            .extend(values.into_iter().map(Ok));
    }

    pub fn push_input_error(&self, pin: u8, error: DeviceError) {
        lock(&self.state)
            .input_queue
            .entry(pin)
            .or_default()
            .push_back(Err(error));
    }

    /// Set the level a pin reports when no readings are queued
    pub fn set_input(&self, pin: u8, value: bool) {
        lock(&self.state).input_level.insert(pin, value);
    }

    pub fn claimed_pins(&self) -> Vec<u8> {
        lock(&self.state).claimed_pins.clone()
    }

    pub fn set_write_delay(&self, delay: Duration) {
        lock(&self.state).write_delay = delay;
    }

    pub fn fail_next_writes(&self, errors: impl IntoIterator<Item = DeviceError>) {
        lock(&self.state).write_failures.extend(errors);
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        lock(&self.state).writes.clone()
    }

    pub fn max_writes_in_flight(&self) -> usize {
        lock(&self.state).max_writes_in_flight
    }

    pub fn io_link_claims(&self) -> usize {
        lock(&self.state).io_link_claims
    }

    pub fn push_detect_result(&self, result: Result<Vec<Carrier>, DeviceError>) {
        lock(&self.state).detect_results.push_back(result);
    }

    pub fn detect_requests(&self) -> Vec<DetectRequest> {
        lock(&self.state).detect_requests.clone()
    }

    /// Every continuous scan requested so far
    pub fn scan_requests(&self) -> Vec<ScanRequest> {
        lock(&self.state).scan_log.clone()
    }

    /// Number of continuous scans whose stream is still held by a consumer
    pub fn active_scans(&self) -> usize {
        lock(&self.state)
            .scans
            .iter()
            .filter(|scan| !scan.tx.is_closed())
            .count()
    }

    /// Deliver a batch to every active continuous scan; returns how many received it
    pub fn emit_scan(&self, carriers: Vec<Carrier>) -> usize {
        let state = lock(&self.state);
        state
            .scans
            .iter()
            .filter(|scan| scan.tx.unbounded_send(Ok(carriers.clone())).is_ok())
            .count()
    }

    /// Fail every active continuous scan
    pub fn fail_scans(&self, error: DeviceError) {
        let state = lock(&self.state);
        for scan in state.scans.iter() {
            let _ = scan.tx.unbounded_send(Err(error.clone()));
        }
    }
}

#[async_trait]
impl DeviceConnector for SimulatedReader {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn DeviceLink>, DeviceError> {
        let (delay, failure) = {
            let mut state = lock(&self.state);
            state.connect_attempts.push(Instant::now());
            (state.connect_delay, state.connect_failures.pop_front())
        };

        if !delay.is_zero() {
            sleep(delay).await;
        }

        if let Some(error) = failure {
            return Err(DeviceError::wrap(
                format!("connect to {} failed", endpoint),
                error,
            ));
        }

        let (loss_tx, loss_rx) = watch::channel(None);
        let loss_tx = Arc::new(loss_tx);
        lock(&self.state).links.push(loss_tx.clone());

        Ok(Arc::new(SimulatedLink {
            state: self.state.clone(),
            loss_tx,
            loss_rx,
        }))
    }

    fn name(&self) -> &'static str {
        "simulator"
    }
}

struct SimulatedLink {
    state: Arc<Mutex<ReaderState>>,
    loss_tx: Arc<LinkLoss>,
    loss_rx: watch::Receiver<Option<DeviceError>>,
}

fn ensure_open(loss: &watch::Receiver<Option<DeviceError>>) -> Result<(), DeviceError> {
    let current = loss.borrow().clone();
    match current {
        Some(error) => Err(DeviceError::wrap("link is down", error)),
        None => Ok(()),
    }
}

#[async_trait]
impl DeviceLink for SimulatedLink {
    async fn closed(&self) -> DeviceError {
        let mut loss = self.loss_rx.clone();
        loop {
            let current = loss.borrow_and_update().clone();
            if let Some(error) = current {
                return error;
            }
            if loss.changed().await.is_err() {
                return DeviceError::new("link dropped");
            }
        }
    }

    fn close(&self) {
        self.loss_tx.send_if_modified(|loss| {
            if loss.is_some() {
                return false;
            }
            *loss = Some(DeviceError::new("connection closed"));
            true
        });
    }

    fn claim_digital_input(&self, pin: u8) -> Result<Arc<dyn DigitalInputPin>, DeviceError> {
        ensure_open(&self.loss_rx)?;

        let mut state = lock(&self.state);
        if state.claimed_pins.contains(&pin) {
            return Err(DeviceError::new(format!("pin {} already claimed", pin)));
        }
        state.claimed_pins.push(pin);

        Ok(Arc::new(SimulatedPin {
            pin,
            state: self.state.clone(),
            loss_rx: self.loss_rx.clone(),
            released: AtomicBool::new(false),
        }))
    }

    fn claim_io_link(&self, params: &IoLinkParams) -> Result<Arc<dyn IoLinkSession>, DeviceError> {
        ensure_open(&self.loss_rx)?;

        lock(&self.state).io_link_claims += 1;

        Ok(Arc::new(SimulatedIoLink {
            params: *params,
            state: self.state.clone(),
            loss_rx: self.loss_rx.clone(),
            released: AtomicBool::new(false),
        }))
    }

    async fn detect_carriers_once(
        &self,
        request: DetectRequest,
    ) -> Result<Vec<Carrier>, DeviceError> {
        ensure_open(&self.loss_rx)?;
        lock(&self.state).detect_requests.push(request);

        sleep(request.scan_time).await;

        ensure_open(&self.loss_rx)?;
        lock(&self.state)
            .detect_results
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn scan_carriers_continuous(&self, request: ScanRequest) -> Result<CarrierStream, DeviceError> {
        ensure_open(&self.loss_rx)?;

        let (tx, rx) = feed::unbounded();
        let mut state = lock(&self.state);
        state.scan_log.push(request);
        state.scans.push(ScanFeed { tx });
        Ok(rx.boxed())
    }
}

struct SimulatedPin {
    pin: u8,
    state: Arc<Mutex<ReaderState>>,
    loss_rx: watch::Receiver<Option<DeviceError>>,
    released: AtomicBool,
}

#[async_trait]
impl DigitalInputPin for SimulatedPin {
    async fn read(&self) -> Result<bool, DeviceError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(DeviceError::new(format!("pin {} released", self.pin)));
        }
        ensure_open(&self.loss_rx)
            .map_err(|e| DeviceError::wrap(format!("poll on pin {} failed", self.pin), e))?;

        let mut state = lock(&self.state);
        let next = state.input_queue.get_mut(&self.pin).and_then(VecDeque::pop_front);
        match next {
            Some(Ok(value)) => {
                state.input_level.insert(self.pin, value);
                Ok(value)
            }
            Some(Err(error)) => Err(error),
            None => Ok(state.input_level.get(&self.pin).copied().unwrap_or(false)),
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            lock(&self.state).claimed_pins.retain(|pin| *pin != self.pin);
        }
    }
}

struct SimulatedIoLink {
    params: IoLinkParams,
    state: Arc<Mutex<ReaderState>>,
    loss_rx: watch::Receiver<Option<DeviceError>>,
    released: AtomicBool,
}

#[async_trait]
impl IoLinkSession for SimulatedIoLink {
    async fn write_cyclic_process_data(
        &self,
        offset: usize,
        data: Bytes,
    ) -> Result<(), DeviceError> {
        let delay = {
            let mut state = lock(&self.state);
            state.writes_in_flight += 1;
            state.max_writes_in_flight = state.max_writes_in_flight.max(state.writes_in_flight);
            state.write_delay
        };

        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut state = lock(&self.state);
        state.writes_in_flight -= 1;

        if self.released.load(Ordering::SeqCst) {
            return Err(DeviceError::new("io-link session released"));
        }
        ensure_open(&self.loss_rx)?;
        if let Some(error) = state.write_failures.pop_front() {
            return Err(error);
        }
        if offset + data.len() > self.params.output_length {
            return Err(DeviceError::new(format!(
                "process data exceeds output length {}",
                self.params.output_length
            )));
        }

        state.writes.push(RecordedWrite {
            at: Instant::now(),
            offset,
            data,
        });
        Ok(())
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            let mut state = lock(&self.state);
            state.io_link_claims = state.io_link_claims.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfid_shared::TagField;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "127.0.0.1".into(),
            port: 10003,
        }
    }

    #[tokio::test]
    async fn test_scripted_connect_failure_wraps_cause() {
        let reader = SimulatedReader::new();
        reader.fail_next_connects([DeviceError::new("refused")]);

        let error = match reader.connect(&endpoint()).await {
            Ok(_) => panic!("connect should fail"),
            Err(e) => e,
        };
        assert_eq!(error.message(), "connect to 127.0.0.1:10003 failed");
        assert_eq!(error.root_cause().message(), "refused");

        assert!(reader.connect(&endpoint()).await.is_ok());
        assert_eq!(reader.connect_attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_close_resolves_closed() {
        let reader = SimulatedReader::new();
        let link = reader.connect(&endpoint()).await.expect("connect");
        assert_eq!(reader.live_links(), 1);

        link.close();
        let error = link.closed().await;
        assert_eq!(error.message(), "connection closed");
        assert_eq!(reader.live_links(), 0);
    }

    #[tokio::test]
    async fn test_pin_claims_are_exclusive() {
        let reader = SimulatedReader::new();
        let link = reader.connect(&endpoint()).await.expect("connect");

        let pin = link.claim_digital_input(2).expect("claim");
        assert!(link.claim_digital_input(2).is_err());

        reader.push_inputs(2, [true, false]);
        assert_eq!(pin.read().await, Ok(true));
        assert_eq!(pin.read().await, Ok(false));
        assert_eq!(pin.read().await, Ok(false));

        pin.release();
        assert!(reader.claimed_pins().is_empty());
        assert!(link.claim_digital_input(2).is_ok());
    }

    #[tokio::test]
    async fn test_scan_stream_stops_when_dropped() {
        let reader = SimulatedReader::new();
        let link = reader.connect(&endpoint()).await.expect("connect");

        let request = ScanRequest {
            field: TagField::EpcBinary,
            page_size: 999,
            interval: Duration::from_millis(100),
        };
        let mut stream = link.scan_carriers_continuous(request).expect("scan");
        assert_eq!(reader.active_scans(), 1);

        let batch = vec![Carrier::new(vec![0xAB, 0xCD], vec![0x01])];
        assert_eq!(reader.emit_scan(batch.clone()), 1);
        assert_eq!(stream.next().await, Some(Ok(batch)));

        drop(stream);
        assert_eq!(reader.active_scans(), 0);
        assert_eq!(reader.emit_scan(Vec::new()), 0);
    }

    #[tokio::test]
    async fn test_scan_requests_survive_link_loss() {
        let reader = SimulatedReader::new();
        let link = reader.connect(&endpoint()).await.expect("connect");

        let request = ScanRequest {
            field: TagField::TidBinary,
            page_size: 50,
            interval: Duration::from_millis(200),
        };
        let mut stream = link.scan_carriers_continuous(request).expect("scan");

        reader.drop_link(DeviceError::new("cable unplugged"));
        let error = match stream.next().await {
            Some(Err(e)) => e,
            other => panic!("expected scan error, got {:?}", other),
        };
        assert_eq!(error.root_cause().message(), "cable unplugged");

        drop(stream);
        reader.drop_link(DeviceError::new("again"));
        assert_eq!(reader.active_scans(), 0);
        assert_eq!(reader.scan_requests(), vec![request]);
    }
}
