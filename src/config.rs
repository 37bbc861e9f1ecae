//! # Server Configuration
//!
//! Immutable configuration loaded once at startup from a JSON file and shared as
//! `Arc<ServerConfig>` with every component that needs it.
//!
//! Every section and field has a default, so a partial file only overrides what it
//! names:
//!
//! ```json
//! {
//!     "serial": { "port": "/dev/ttyAMA0", "baudrate": 19200, "parity": "E" },
//!     "industrial_features": { "enable_redundancy": true, "redundant_port": "/dev/ttyUSB1" }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_SLAVE_ID, MIN_SLAVE_ID};
use crate::error::{ModbusError, ModbusResult};
use crate::store::SlaveConfig;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "modbus_server_config.json";

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Parity {
    #[default]
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Primary serial device
    pub port: String,
    pub baudrate: u32,
    /// Data bits (5-8)
    pub bytesize: u8,
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stopbits: u8,
    /// Read poll interval in seconds; a quiet bus wakes the loop this often
    pub timeout: f64,
    /// Inter-frame silence override in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inter_frame_timeout_ms: Option<u64>,
    /// Log every received and sent frame as hex
    pub packet_logging: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baudrate: 9600,
            bytesize: 8,
            parity: Parity::None,
            stopbits: 1,
            timeout: 1.0,
            inter_frame_timeout_ms: None,
            packet_logging: false,
        }
    }
}

impl SerialConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(0.001))
    }

    /// Silence that terminates a frame.
    ///
    /// 3.5 character times of 11 bits each, floored at 1.75 ms above 19200 baud.
    pub fn inter_frame_timeout(&self) -> Duration {
        if let Some(ms) = self.inter_frame_timeout_ms {
            return Duration::from_millis(ms);
        }
        if self.baudrate > 19200 {
            return Duration::from_micros(1750);
        }
        let char_time_us = 11_000_000 / u64::from(self.baudrate.max(1));
        Duration::from_micros(char_time_us * 35 / 10)
    }
}

/// Server-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub max_slaves: usize,
    /// Statistics report period in seconds
    pub stats_interval: u64,
    /// Snapshot period in seconds
    pub backup_interval: u64,
    pub log_level: String,
    pub response_timeout_ms: u64,
    /// Consecutive I/O failures before the transport loop is degraded
    pub degraded_threshold: u32,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            max_slaves: 10,
            stats_interval: 60,
            backup_interval: 300,
            log_level: "info".to_string(),
            response_timeout_ms: 1000,
            degraded_threshold: 3,
            reconnect_delay_ms: 2000,
            max_reconnect_delay_ms: 20_000,
        }
    }
}

impl ServerSection {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval.max(1))
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval.max(1))
    }
}

/// Resource thresholds for constrained single-board hosts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Degrees Celsius above which the transport loop is throttled
    pub temperature_threshold: f64,
    /// Throttling clears below `temperature_threshold - temperature_hysteresis`
    pub temperature_hysteresis: f64,
    /// Percent
    pub swap_usage_threshold: f64,
    pub memory_limit_mb: u64,
    /// Percent
    pub cpu_threshold: f64,
    /// Sampling period in seconds
    pub check_interval: u64,
    /// Extra delay between polls while throttled
    pub throttle_delay_ms: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            temperature_threshold: 70.0,
            temperature_hysteresis: 5.0,
            swap_usage_threshold: 50.0,
            memory_limit_mb: 400,
            cpu_threshold: 80.0,
            check_interval: 30,
            throttle_delay_ms: 50,
        }
    }
}

impl ResourceConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval.max(1))
    }

    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }
}

/// Watchdog, backup and redundancy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndustrialFeatures {
    pub enable_watchdog: bool,
    /// Seconds without a transport heartbeat before the process is unhealthy
    pub watchdog_timeout: u64,
    pub enable_backup: bool,
    pub backup_directory: PathBuf,
    pub enable_redundancy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redundant_port: Option<String>,
    /// Consecutive endpoint failures tolerated before failing over
    pub failover_threshold: u32,
    /// Seconds on the secondary before an automatic failback is attempted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failback_cooldown: Option<u64>,
}

impl Default for IndustrialFeatures {
    fn default() -> Self {
        Self {
            enable_watchdog: true,
            watchdog_timeout: 30,
            enable_backup: false,
            backup_directory: PathBuf::from("/var/backups/modbus"),
            enable_redundancy: false,
            redundant_port: None,
            failover_threshold: 3,
            failback_cooldown: None,
        }
    }
}

impl IndustrialFeatures {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout)
    }

    pub fn failback_cooldown(&self) -> Option<Duration> {
        self.failback_cooldown.map(Duration::from_secs)
    }
}

/// Complete server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub serial: SerialConfig,
    pub server: ServerSection,
    pub pi_zero_optimization: ResourceConfig,
    pub industrial_features: IndustrialFeatures,
    /// Slaves registered at startup
    pub slaves: Vec<SlaveConfig>,
}

impl ServerConfig {
    /// Load and validate a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate a JSON document
    pub fn from_json(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> ModbusResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> ModbusResult<()> {
        let serial = &self.serial;
        if serial.port.trim().is_empty() {
            return Err(ModbusError::configuration("serial.port must not be empty"));
        }
        if serial.baudrate == 0 {
            return Err(ModbusError::configuration("serial.baudrate must be positive"));
        }
        if !(5..=8).contains(&serial.bytesize) {
            return Err(ModbusError::configuration(format!(
                "serial.bytesize must be 5-8, got {}",
                serial.bytesize
            )));
        }
        if !(1..=2).contains(&serial.stopbits) {
            return Err(ModbusError::configuration(format!(
                "serial.stopbits must be 1 or 2, got {}",
                serial.stopbits
            )));
        }
        if !serial.timeout.is_finite() || serial.timeout <= 0.0 {
            return Err(ModbusError::configuration("serial.timeout must be positive"));
        }
        if self.server.max_slaves == 0 {
            return Err(ModbusError::configuration("server.max_slaves must be at least 1"));
        }
        if self.pi_zero_optimization.temperature_hysteresis < 0.0 {
            return Err(ModbusError::configuration(
                "pi_zero_optimization.temperature_hysteresis must not be negative",
            ));
        }

        let features = &self.industrial_features;
        if features.enable_watchdog {
            let watchdog = features.watchdog_timeout();
            if watchdog.is_zero() {
                return Err(ModbusError::configuration(
                    "industrial_features.watchdog_timeout must be positive",
                ));
            }
            if watchdog <= serial.poll_timeout() {
                return Err(ModbusError::configuration(
                    "industrial_features.watchdog_timeout must exceed serial.timeout",
                ));
            }
            if watchdog <= Duration::from_millis(self.server.max_reconnect_delay_ms) {
                return Err(ModbusError::configuration(
                    "industrial_features.watchdog_timeout must exceed server.max_reconnect_delay_ms",
                ));
            }
        }
        if features.enable_redundancy
            && features
                .redundant_port
                .as_deref()
                .map_or(true, |port| port.trim().is_empty())
        {
            return Err(ModbusError::configuration(
                "industrial_features.redundant_port is required when redundancy is enabled",
            ));
        }

        if self.slaves.len() > self.server.max_slaves {
            return Err(ModbusError::configuration(format!(
                "{} slaves configured, server.max_slaves is {}",
                self.slaves.len(),
                self.server.max_slaves
            )));
        }
        for slave in &self.slaves {
            if !(MIN_SLAVE_ID..=MAX_SLAVE_ID).contains(&slave.slave_id) {
                return Err(ModbusError::configuration(format!(
                    "slave id {} outside {}-{}",
                    slave.slave_id, MIN_SLAVE_ID, MAX_SLAVE_ID
                )));
            }
        }
        Ok(())
    }
}
