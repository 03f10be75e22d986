//! Error taxonomy for the reader bridge
//!
//! - [`ConfigError`]: fatal, raised while validating settings before any
//!   connect attempt.
//! - [`DeviceError`]: anything reported by the reader, possibly wrapping a
//!   chain of causes. Only the root cause is shown to the operator, the full
//!   chain goes to the diagnostic log via [`format_chain`].
//! - [`NodeError`]: what a consumer reports to the host runtime.

use std::error::Error as StdError;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

use crate::limits::{MAX_DEVICE_ID, MAX_PROCESS_DATA_LEN, MAX_VENDOR_ID};

/// Invalid settings, detected before anything touches the device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid host: {0:?}")]
    InvalidHost(String),

    #[error("invalid port: {0}")]
    InvalidPort(u16),

    #[error("invalid vendor id: {0} (max: {MAX_VENDOR_ID})")]
    InvalidVendorId(u32),

    #[error("invalid device id: {0} (max: {MAX_DEVICE_ID})")]
    InvalidDeviceId(u32),

    #[error("invalid {direction} length: {length} (expected 1..={MAX_PROCESS_DATA_LEN})")]
    InvalidFrameLength {
        direction: &'static str,
        length: usize,
    },

    #[error("invalid pin number: {0}")]
    InvalidPin(u8),

    #[error("invalid {0}: must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Error reported by the reader, optionally wrapping the error that caused it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DeviceError {
    message: String,
    #[source]
    cause: Option<Arc<DeviceError>>,
}

impl DeviceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap `cause` into a new error with additional context
    pub fn wrap(message: impl Into<String>, cause: DeviceError) -> Self {
        Self {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&DeviceError> {
        self.cause.as_deref()
    }

    /// The innermost error of the chain
    pub fn root_cause(&self) -> &DeviceError {
        let mut current = self;
        while let Some(cause) = current.cause() {
            current = cause;
        }
        current
    }
}

/// Render an error and all of its sources on one line for diagnostic logging
pub fn format_chain(error: &(dyn StdError + 'static)) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(out, ": caused by: {}", cause);
        source = cause.source();
    }
    out
}

/// Errors a consumer surfaces to the host runtime
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("not connected")]
    NotConnected,

    #[error("scan already started")]
    ScanAlreadyStarted,

    #[error("scan not started")]
    ScanNotStarted,

    #[error("scan already in progress")]
    DetectInProgress,

    #[error("invalid payload length: expected {expected} bytes, got {actual}")]
    InvalidPayloadLength { expected: usize, actual: usize },

    #[error(transparent)]
    Device(DeviceError),
}

impl NodeError {
    /// Host-facing form of a device error: only the root cause is kept
    pub fn reported(error: &DeviceError) -> Self {
        NodeError::Device(error.root_cause().clone())
    }

    /// Rejections of a concurrent command, which do not affect the status indicator
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            NodeError::ScanAlreadyStarted | NodeError::ScanNotStarted | NodeError::DetectInProgress
        )
    }
}
