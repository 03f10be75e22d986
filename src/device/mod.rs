//! Device abstraction for the RFID/IO-Link reader
//!
//! The wire protocol lives behind these traits. The bridge ships with a
//! simulated reader for local runs and tests.

pub mod simulator;
pub mod traits;

pub use simulator::SimulatedReader;
pub use traits::{
    CarrierStream, DetectRequest, DeviceConnector, DeviceLink, DigitalInputPin, Endpoint,
    IoLinkParams, IoLinkSession, ScanRequest,
};
