//! Engine configuration
//!
//! Loaded from an optional TOML file, then overridden by `OBD_*` environment
//! variables (`__` separates nested keys, e.g. `OBD_ADAPTER__ADDRESS`).

use crate::transport::{ConnectionParams, TransportKind};
use config::{Config, ConfigError, Environment, File};
use obd_protocol::{DiscoveryConfig, InitConfig, DEFAULT_TIMEOUT_MS, MAX_ECUS};
use obd_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Which adapter to connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Identifier reported back to the host
    pub id: String,
    pub transport: TransportKind,
    /// Serial device path or `host:port`
    pub address: String,
    /// Use the in-process simulated adapter instead of real hardware
    pub simulated: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            id: "obd-adapter".to_string(),
            transport: TransportKind::Usb,
            address: "/dev/ttyUSB0".to_string(),
            simulated: false,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default per-command timeout (default: 2000ms)
    pub command_timeout_ms: u64,
    /// Timeout for the adapter reset (default: 5000ms)
    pub reset_timeout_ms: u64,
    /// Total budget for connect (default: 30s)
    pub connect_timeout_ms: u64,
    /// Logical ECU addresses to probe (1-8)
    pub max_ecus: usize,
    /// Serial speed for USB and Bluetooth adapters
    pub baud_rate: u32,
    /// Poll interval used by the command-line monitor
    pub monitor_interval_ms: u64,
    /// Parameters polled by the command-line monitor
    pub monitor_pids: Vec<String>,
    pub log_format: LogFormat,
    pub adapter: AdapterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_TIMEOUT_MS,
            reset_timeout_ms: 5000,
            connect_timeout_ms: 30_000,
            max_ecus: MAX_ECUS,
            baud_rate: 38400,
            monitor_interval_ms: 1000,
            monitor_pids: vec!["010C".to_string(), "010D".to_string(), "0105".to_string()],
            log_format: LogFormat::Pretty,
            adapter: AdapterConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from an optional file plus `OBD_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder
            .add_source(
                Environment::with_prefix("OBD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn init_config(&self) -> InitConfig {
        InitConfig {
            command_timeout_ms: self.command_timeout_ms,
            reset_timeout_ms: self.reset_timeout_ms,
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            max_ecus: self.max_ecus.clamp(1, MAX_ECUS),
            command_timeout_ms: self.command_timeout_ms,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            command_timeout_ms: self.command_timeout_ms,
            ..Default::default()
        }
    }

    /// Connection parameters for the configured adapter
    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            address: self.adapter.address.clone(),
            baud_rate: self.baud_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.command_timeout_ms, 2000);
        assert_eq!(config.discovery_config().max_ecus, 8);
        assert_eq!(config.scheduler_config().command_timeout_ms, 2000);
        assert_eq!(config.adapter.transport, TransportKind::Usb);
    }

    #[test]
    fn test_max_ecus_is_clamped() {
        let config = EngineConfig {
            max_ecus: 20,
            ..Default::default()
        };
        assert_eq!(config.discovery_config().max_ecus, MAX_ECUS);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("obd-engine-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "command_timeout_ms = 750\nlog_format = \"json\"\n\n[adapter]\ntransport = \"wifi\"\naddress = \"192.168.0.10:35000\""
        )
        .unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.command_timeout_ms, 750);
        assert_eq!(config.reset_timeout_ms, 5000);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.adapter.transport, TransportKind::WiFi);
        assert_eq!(config.connection_params().address, "192.168.0.10:35000");
        assert!(!config.adapter.simulated);
    }
}
