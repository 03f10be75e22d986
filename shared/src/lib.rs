//! RFID Bridge Shared Types
//!
//! This crate provides the types shared between the connection manager, the
//! consumers (digital input, cyclic output, carrier scanner) and the device
//! abstraction of the reader bridge.

pub mod error;
pub mod state_machine;

use bytes::Bytes;
use serde::Deserialize;
use std::fmt;

// Re-export commonly used types at crate root
pub use error::{format_chain, ConfigError, DeviceError, NodeError};

/// Timing and sizing parameters for the bridge
pub mod timing {
    /// Fixed delay between a failed connection attempt and the next one
    pub const RECONNECT_DELAY_MS: u64 = 2000;

    /// Upper bound for a single connect attempt
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Page size used for continuous scans. Other values are not honored by the reader.
    pub const MAX_CARRIERS_PER_REQUEST: u32 = 999;

    /// How long a digital input shows "busy" after a trigger
    pub const TRIGGER_STATUS_HOLD_MS: u64 = 1000;

    /// How long the cyclic output shows "busy" after a write started
    pub const WRITE_STATUS_HOLD_MS: u64 = 300;
}

/// Hardware limits of the reader
pub mod limits {
    /// Pins that can be claimed as digital inputs
    pub const DIGITAL_INPUT_PINS: [u8; 2] = [2, 4];

    /// IO-Link vendor ids are 16 bit
    pub const MAX_VENDOR_ID: u32 = 0xFFFF;

    /// IO-Link device ids are 24 bit
    pub const MAX_DEVICE_ID: u32 = 0xFF_FFFF;

    /// Maximum IO-Link process data frame length in bytes
    pub const MAX_PROCESS_DATA_LEN: usize = 32;
}

/// Which tag memory bank identifies a carrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagField {
    EpcBinary,
    TidBinary,
}

impl TagField {
    /// Data type selector understood by the reader
    pub fn code(self) -> char {
        match self {
            TagField::EpcBinary => 'E',
            TagField::TidBinary => 'T',
        }
    }
}

impl fmt::Display for TagField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagField::EpcBinary => write!(f, "epc-binary"),
            TagField::TidBinary => write!(f, "tid-binary"),
        }
    }
}

/// How a one-shot detection accumulates tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectMode {
    /// Only tags present at the end of the scan window
    #[default]
    Live,
    /// Every tag seen during the scan window
    Cumulated,
}

/// A detected RFID tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Carrier {
    pub epc: Bytes,
    pub tid: Bytes,
}

impl Carrier {
    pub fn new(epc: impl Into<Bytes>, tid: impl Into<Bytes>) -> Self {
        Self {
            epc: epc.into(),
            tid: tid.into(),
        }
    }

    /// Lowercase hex of the selected tag field, used to recognise a carrier across scans
    pub fn identity(&self, field: TagField) -> String {
        match field {
            TagField::EpcBinary => to_hex(&self.epc),
            TagField::TidBinary => to_hex(&self.tid),
        }
    }
}

/// Encode bytes as lowercase hex
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// When a digital input reading is forwarded to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgePolicy {
    /// Every reading
    Read,
    /// Readings that differ from the previous one
    Change,
    /// `false -> true` transitions
    RisingEdge,
    /// `true -> false` transitions
    FallingEdge,
}

impl EdgePolicy {
    /// Decide whether `value` is emitted given the previously observed value.
    ///
    /// `previous` is `None` on the first reading after a (re)bind, so edge
    /// policies never fire on that reading.
    pub fn should_emit(self, previous: Option<bool>, value: bool) -> bool {
        match self {
            EdgePolicy::Read => true,
            EdgePolicy::Change => previous != Some(value),
            EdgePolicy::RisingEdge => previous == Some(false) && value,
            EdgePolicy::FallingEdge => previous == Some(true) && !value,
        }
    }

    /// Whether an emission counts as a trigger for the status indicator
    pub fn is_trigger(self) -> bool {
        !matches!(self, EdgePolicy::Read)
    }
}

/// Six-state status indicator driven by each consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Busy,
    Error,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NodeStatus::Idle => "idle",
            NodeStatus::Connecting => "connecting",
            NodeStatus::Connected => "connected",
            NodeStatus::Disconnected => "disconnected",
            NodeStatus::Busy => "busy",
            NodeStatus::Error => "error",
        };
        f.write_str(text)
    }
}

/// Events a consumer emits towards the host runtime
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// Digital input reading `{payload: bool}`
    Value(bool),
    /// Scan result `{carriers: [...]}`
    Carriers(Vec<Carrier>),
    /// Root-caused error report
    Error(NodeError),
    /// Non-fatal notice for the operator
    Warning(String),
    /// Status indicator change
    Status(NodeStatus),
}
