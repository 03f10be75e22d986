//! Device trait abstraction for pluggable reader backends

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use rfid_shared::{Carrier, DetectMode, DeviceError, TagField};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Network address of a reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity and frame layout of the IO-Link device behind the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoLinkParams {
    pub vendor_id: u32,
    pub device_id: u32,
    /// Process data length written to the device
    pub output_length: usize,
    /// Process data length read from the device
    pub input_length: usize,
    pub cycle_time_base: u8,
    pub cycle_time: u8,
    pub safe_state: u8,
    pub validation_mode: u8,
}

impl IoLinkParams {
    pub fn new(vendor_id: u32, device_id: u32, output_length: usize, input_length: usize) -> Self {
        Self {
            vendor_id,
            device_id,
            output_length,
            input_length,
            cycle_time_base: 0,
            cycle_time: 0,
            safe_state: 0,
            validation_mode: 0,
        }
    }
}

/// Parameters of a bounded one-shot detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectRequest {
    pub field: TagField,
    pub scan_time: Duration,
    pub mode: DetectMode,
}

/// Parameters of a continuous, device-driven scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRequest {
    pub field: TagField,
    pub page_size: u32,
    pub interval: Duration,
}

/// Batches produced by a continuous scan. Dropping the stream stops the scan.
pub type CarrierStream = BoxStream<'static, Result<Vec<Carrier>, DeviceError>>;

/// Factory for reader connections
#[async_trait]
pub trait DeviceConnector: Send + Sync + 'static {
    /// Attempt to connect, returning a live link on success
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn DeviceLink>, DeviceError>;

    /// Human-readable name for this backend
    fn name(&self) -> &'static str;
}

/// A live session with the reader
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Resolves with the error that ended the link (including a local `close()`)
    async fn closed(&self) -> DeviceError;

    /// Close the link
    fn close(&self);

    fn claim_digital_input(&self, pin: u8) -> Result<Arc<dyn DigitalInputPin>, DeviceError>;

    fn claim_io_link(&self, params: &IoLinkParams) -> Result<Arc<dyn IoLinkSession>, DeviceError>;

    async fn detect_carriers_once(&self, request: DetectRequest)
        -> Result<Vec<Carrier>, DeviceError>;

    fn scan_carriers_continuous(&self, request: ScanRequest) -> Result<CarrierStream, DeviceError>;
}

/// A pin claimed as digital input
#[async_trait]
pub trait DigitalInputPin: Send + Sync {
    async fn read(&self) -> Result<bool, DeviceError>;

    fn release(&self);
}

/// A claimed IO-Link port
#[async_trait]
pub trait IoLinkSession: Send + Sync {
    async fn write_cyclic_process_data(&self, offset: usize, data: Bytes)
        -> Result<(), DeviceError>;

    fn release(&self);
}
