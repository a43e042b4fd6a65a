//! Configuration for the power meter exporter.

use powermeter_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::catalog::{Metric, RegisterMapEntry};

/// File name looked up next to the executable when the requested
/// configuration file does not exist.
pub const FALLBACK_CONFIG_NAME: &str = "powermeter.json5";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Config file not found: {} (no powermeter.json5 next to the executable either)", .0.display())]
    NotFound(PathBuf),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Modbus bus settings
    pub modbus: ModbusConfig,

    /// HTTP endpoint settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Meters on the bus, in exposition order
    pub meters: Vec<MeterEntry>,

    /// Additional register maps, keyed by device type name
    #[serde(default)]
    pub device_types: BTreeMap<String, DeviceTypeConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Modbus bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries of a request after a timeout or transport error
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Log level for the Modbus client library (e.g. "debug")
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_retries() -> u32 {
    3
}

/// Connection configuration (TCP or RTU).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection (e.g. to a serial gateway)
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (default: "0.0.0.0:9100").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Metric name prefix (default: "powermeter").
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Log every HTTP request.
    #[serde(default)]
    pub access_log: bool,
}

fn default_listen() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "powermeter".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            prefix: default_prefix(),
            access_log: false,
        }
    }
}

/// A meter on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterEntry {
    /// Modbus unit/slave ID (1-247)
    pub address: u8,

    /// Device type name: a built-in catalog or a key of `device_types`
    #[serde(rename = "type")]
    pub device_type: String,

    /// Catalog entries to read even though they ship disabled
    #[serde(default)]
    pub enable: Vec<Metric>,
}

/// A register map defined in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTypeConfig {
    pub registers: Vec<RegisterMapEntry>,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Meter addresses and device types are checked when the registry is
    /// resolved.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.meters.is_empty() {
            return Err(ConfigError::Validation(
                "At least one meter must be configured".to_string(),
            ));
        }

        if self.modbus.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "timeout_ms must be > 0".to_string(),
            ));
        }

        if let ConnectionConfig::Rtu {
            parity,
            data_bits,
            stop_bits,
            ..
        } = &self.modbus.connection
        {
            match parity.to_lowercase().as_str() {
                "none" | "even" | "odd" => {}
                _ => {
                    return Err(ConfigError::Validation(format!(
                        "Invalid parity '{}' (use none, even, or odd)",
                        parity
                    )));
                }
            }

            if !(5..=8).contains(data_bits) {
                return Err(ConfigError::Validation(format!(
                    "Invalid data_bits {} (use 5-8)",
                    data_bits
                )));
            }

            if !(1..=2).contains(stop_bits) {
                return Err(ConfigError::Validation(format!(
                    "Invalid stop_bits {} (use 1 or 2)",
                    stop_bits
                )));
            }
        }

        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.server.listen
            )));
        }

        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        Ok(())
    }

    /// Extra tracing directives derived from the configuration.
    pub fn log_directives(&self) -> Vec<String> {
        self.modbus
            .log_level
            .iter()
            .map(|level| format!("tokio_modbus={}", level))
            .collect()
    }
}

/// Find the configuration file to load.
///
/// Returns `requested` if it exists, else `powermeter.json5` next to the
/// running executable.
pub fn locate(requested: &Path) -> Result<PathBuf, ConfigError> {
    if requested.is_file() {
        return Ok(requested.to_path_buf());
    }

    let fallback = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(FALLBACK_CONFIG_NAME)));

    match fallback {
        Some(path) if path.is_file() => Ok(path),
        _ => Err(ConfigError::NotFound(requested.to_path_buf())),
    }
}
