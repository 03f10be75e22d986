//! Bridge configuration file
//!
//! Settings are plain serde structs mirroring the JSON file. They are turned
//! into validated runtime configs before anything connects.

use crate::connection::ConnectionConfig;
use crate::consumer::{CyclicOutputConfig, DigitalInputConfig, ScannerConfig, ScannerMode};
use crate::device::{Endpoint, IoLinkParams};
use anyhow::Context;
use rfid_shared::timing::{CONNECT_TIMEOUT_MS, MAX_CARRIERS_PER_REQUEST, RECONNECT_DELAY_MS};
use rfid_shared::{ConfigError, DetectMode, EdgePolicy, TagField};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub connection: ConnectionSettings,
    pub digital_inputs: Vec<DigitalInputSettings>,
    pub cyclic_outputs: Vec<CyclicOutputSettings>,
    pub scanners: Vec<ScannerSettings>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            digital_inputs: vec![DigitalInputSettings {
                name: "light-barrier".into(),
                pin: 2,
                poll_ms: default_poll_ms(),
                events: EdgePolicy::RisingEdge,
            }],
            cyclic_outputs: vec![CyclicOutputSettings {
                name: "stack-light".into(),
                debounce_ms: 50,
            }],
            scanners: vec![
                ScannerSettings {
                    name: "gate-detect".into(),
                    data_type: TagField::EpcBinary,
                    mode: ScannerModeSettings::Detect {
                        detect_mode: DetectMode::Live,
                        scan_time_ms: 500,
                    },
                },
                ScannerSettings {
                    name: "conveyor-scan".into(),
                    data_type: TagField::EpcBinary,
                    mode: ScannerModeSettings::Continuous {
                        poll_interval_ms: 250,
                        emit_tags_only_once: true,
                        emit_empty_list: false,
                        max_carriers_per_request: MAX_CARRIERS_PER_REQUEST,
                    },
                },
            ],
        }
    }
}

impl BridgeSettings {
    /// Read and parse a JSON settings file
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub iolink_vendor_id: u32,
    pub iolink_device_id: u32,
    pub iolink_output_length: usize,
    pub iolink_input_length: usize,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 10003,
            iolink_vendor_id: 888,
            iolink_device_id: 1,
            iolink_output_length: 2,
            iolink_input_length: 2,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
        }
    }
}

impl ConnectionSettings {
    pub fn to_config(&self) -> Result<ConnectionConfig, ConfigError> {
        let config = ConnectionConfig {
            endpoint: Endpoint {
                host: self.host.clone(),
                port: self.port,
            },
            io_link: IoLinkParams::new(
                self.iolink_vendor_id,
                self.iolink_device_id,
                self.iolink_output_length,
                self.iolink_input_length,
            ),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

fn default_poll_ms() -> u64 {
    100
}

fn default_events() -> EdgePolicy {
    EdgePolicy::Change
}

fn default_page_size() -> u32 {
    MAX_CARRIERS_PER_REQUEST
}

#[derive(Debug, Clone, Deserialize)]
pub struct DigitalInputSettings {
    pub name: String,
    pub pin: u8,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_events")]
    pub events: EdgePolicy,
}

impl DigitalInputSettings {
    pub fn to_config(&self) -> Result<DigitalInputConfig, ConfigError> {
        let config = DigitalInputConfig {
            pin: self.pin,
            poll_interval: Duration::from_millis(self.poll_ms),
            policy: self.events,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CyclicOutputSettings {
    pub name: String,
    #[serde(default)]
    pub debounce_ms: u64,
}

impl CyclicOutputSettings {
    pub fn to_config(&self) -> CyclicOutputConfig {
        CyclicOutputConfig {
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerSettings {
    pub name: String,
    pub data_type: TagField,
    #[serde(flatten)]
    pub mode: ScannerModeSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ScannerModeSettings {
    Detect {
        #[serde(default)]
        detect_mode: DetectMode,
        scan_time_ms: u64,
    },
    Continuous {
        poll_interval_ms: u64,
        #[serde(default)]
        emit_tags_only_once: bool,
        #[serde(default)]
        emit_empty_list: bool,
        #[serde(default = "default_page_size")]
        max_carriers_per_request: u32,
    },
}

impl ScannerSettings {
    pub fn to_config(&self) -> Result<ScannerConfig, ConfigError> {
        let mode = match self.mode {
            ScannerModeSettings::Detect {
                detect_mode,
                scan_time_ms,
            } => ScannerMode::Detect {
                mode: detect_mode,
                scan_time: Duration::from_millis(scan_time_ms),
            },
            ScannerModeSettings::Continuous {
                poll_interval_ms,
                emit_tags_only_once,
                emit_empty_list,
                max_carriers_per_request,
            } => ScannerMode::Continuous {
                poll_interval: Duration::from_millis(poll_interval_ms),
                dedup: emit_tags_only_once,
                emit_empty: emit_empty_list,
                page_size: max_carriers_per_request,
            },
        };

        let config = ScannerConfig {
            field: self.data_type,
            mode,
        };
        config.validate()?;
        Ok(config)
    }
}
