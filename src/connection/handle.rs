//! Consumer-facing handle to the live reader connection

use crate::device::{
    CarrierStream, DetectRequest, DeviceLink, DigitalInputPin, IoLinkParams, IoLinkSession,
    ScanRequest,
};
use rfid_shared::{Carrier, DeviceError};
use std::fmt;
use std::sync::Arc;

/// Identity of a connection, unique for the lifetime of a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(super) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read-only reference to the manager's current connection.
///
/// Consumers can claim resources and scan through it, but only the
/// [`ConnectionManager`](super::ConnectionManager) can close it.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    link: Arc<dyn DeviceLink>,
}

impl Connection {
    pub(super) fn new(id: ConnectionId, link: Arc<dyn DeviceLink>) -> Self {
        Self { id, link }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn claim_digital_input(&self, pin: u8) -> Result<Arc<dyn DigitalInputPin>, DeviceError> {
        self.link.claim_digital_input(pin)
    }

    pub fn claim_io_link(
        &self,
        params: &IoLinkParams,
    ) -> Result<Arc<dyn IoLinkSession>, DeviceError> {
        self.link.claim_io_link(params)
    }

    pub async fn detect_carriers_once(
        &self,
        request: DetectRequest,
    ) -> Result<Vec<Carrier>, DeviceError> {
        self.link.detect_carriers_once(request).await
    }

    pub fn scan_carriers_continuous(
        &self,
        request: ScanRequest,
    ) -> Result<CarrierStream, DeviceError> {
        self.link.scan_carriers_continuous(request)
    }

    pub(super) fn shutdown(&self) {
        self.link.close();
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

/// Current phase of the manager as seen by consumers
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// `start()` not called yet
    Idle,
    /// Attempt outstanding; carries the error of the previous attempt, if any
    Connecting { last_error: Option<DeviceError> },
    Connected(Connection),
    Disconnected(DeviceError),
    Closed,
}

impl ConnectionState {
    /// The notification a freshly subscribed consumer should apply
    pub fn as_change(&self) -> StateChange {
        match self {
            ConnectionState::Idle | ConnectionState::Closed => StateChange::default(),
            ConnectionState::Connecting { last_error } => StateChange {
                connecting: true,
                connection: None,
                error: last_error.clone(),
            },
            ConnectionState::Connected(connection) => StateChange {
                connecting: false,
                connection: Some(connection.clone()),
                error: None,
            },
            ConnectionState::Disconnected(error) => StateChange {
                connecting: false,
                connection: None,
                error: Some(error.clone()),
            },
        }
    }

    pub fn connection(&self) -> Option<&Connection> {
        match self {
            ConnectionState::Connected(connection) => Some(connection),
            _ => None,
        }
    }
}

/// Notification fanned out to subscribers on every state change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateChange {
    pub connecting: bool,
    pub connection: Option<Connection>,
    pub error: Option<DeviceError>,
}
