//! Typed configuration for the PLC bridge.
//!
//! Settings are loaded from a TOML file merged with `BRIDGE_`-prefixed
//! environment variables, then validated as a whole. Every field has a
//! default matching the reference deployment (CLICK PLC on
//! `/dev/ttyUSB0`, 9600 baud, slave address 1).

use std::path::Path;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors surfaced at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File/env extraction failed
    #[error("Failed to load configuration: {0}")]
    Load(String),

    /// A recognized option has an invalid value
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Modbus specification limit for a single bit read (FC01/FC02).
pub const MAX_READ_BITS: u16 = 2000;

/// Modbus specification limit for a single register read (FC03).
pub const MAX_READ_REGISTERS: u16 = 125;

/// A contiguous block of point offsets polled in one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRange {
    /// First offset of the block
    pub start: u16,
    /// Number of points in the block
    pub count: u16,
}

impl RegionRange {
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    /// Whether `offset` falls inside this range.
    pub fn contains(&self, offset: u16) -> bool {
        offset >= self.start && (offset - self.start) < self.count
    }
}

/// Serial line settings for the fieldbus port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Serial device path, e.g. `/dev/ttyUSB0`
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// "none", "even" or "odd"
    pub parity: String,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
        }
    }
}

/// Modbus transaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusSettings {
    /// Slave address of the PLC (1..=247)
    pub device_address: u8,
    /// Per-attempt response timeout
    pub transaction_timeout_ms: u64,
    /// Attempts per transaction before giving up (>= 1)
    pub max_retries: u32,
    /// Delay between attempts
    pub retry_backoff_ms: u64,
    /// Double the delay on each failed attempt (capped at 10x base)
    pub exponential_backoff: bool,
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            device_address: 1,
            transaction_timeout_ms: 1000,
            max_retries: 3,
            retry_backoff_ms: 100,
            exponential_backoff: false,
        }
    }
}

/// Polling scheduler settings: cadence plus the three data regions
/// read every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub poll_interval_ms: u64,
    /// Consecutive failed transactions before `connected` flips false
    pub failure_threshold: u32,
    pub discrete_inputs: RegionRange,
    pub coils: RegionRange,
    pub registers: RegionRange,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            failure_threshold: 3,
            discrete_inputs: RegionRange::new(0, 16),
            coils: RegionRange::new(0, 16),
            registers: RegionRange::new(0, 10),
        }
    }
}

/// User script engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    /// Scheduler tick granularity
    pub tick_ms: u64,
    /// Hard execution budget per invocation
    pub execution_budget_ms: u64,
    /// SQLite database holding script definitions
    pub db_path: String,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            execution_budget_ms: 2000,
            db_path: "bridge.db".to_string(),
        }
    }
}

/// WiFi / access-point fallback settings for constrained deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub wifi_ssid: String,
    pub wifi_password: String,
    /// SSID served while in access-point fallback
    pub ap_ssid: String,
    /// WPA2 requires at least 8 characters
    pub ap_password: String,
    pub wifi_connect_timeout_ms: u64,
    /// Bind address for the configuration portal
    pub portal_listen: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            ap_ssid: "PLC-Bridge-Setup".to_string(),
            ap_password: "plcsetup123".to_string(),
            wifi_connect_timeout_ms: 15_000,
            portal_listen: "192.168.4.1:80".to_string(),
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub serial: SerialSettings,
    pub modbus: ModbusSettings,
    pub polling: PollingSettings,
    pub scripts: ScriptSettings,
    pub network: NetworkSettings,
}

impl BridgeConfig {
    /// Load from a TOML file merged with `BRIDGE_`-prefixed environment
    /// variables (`BRIDGE_MODBUS__DEVICE_ADDRESS=2` style nesting),
    /// then validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: BridgeConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BRIDGE_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables only (no file).
    pub fn from_env() -> Result<Self> {
        let config: BridgeConfig = Figment::new()
            .merge(Env::prefixed("BRIDGE_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field and range invariants.
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            return Err(ConfigError::Invalid("serial.port must not be empty".into()));
        }
        if !matches!(self.serial.parity.as_str(), "none" | "even" | "odd") {
            return Err(ConfigError::Invalid(format!(
                "serial.parity must be none/even/odd, got '{}'",
                self.serial.parity
            )));
        }
        if self.modbus.device_address == 0 || self.modbus.device_address > 247 {
            return Err(ConfigError::Invalid(format!(
                "modbus.device_address must be 1..=247, got {}",
                self.modbus.device_address
            )));
        }
        if self.modbus.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "modbus.max_retries must be at least 1".into(),
            ));
        }
        if self.modbus.transaction_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "modbus.transaction_timeout_ms must be non-zero".into(),
            ));
        }
        if self.polling.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "polling.poll_interval_ms must be non-zero".into(),
            ));
        }
        if self.polling.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "polling.failure_threshold must be at least 1".into(),
            ));
        }

        for (name, range, limit) in [
            ("discrete_inputs", self.polling.discrete_inputs, MAX_READ_BITS),
            ("coils", self.polling.coils, MAX_READ_BITS),
            ("registers", self.polling.registers, MAX_READ_REGISTERS),
        ] {
            if range.count == 0 {
                return Err(ConfigError::Invalid(format!(
                    "polling.{name}.count must be non-zero"
                )));
            }
            if range.count > limit {
                return Err(ConfigError::Invalid(format!(
                    "polling.{name}.count {} exceeds the per-read limit of {limit}",
                    range.count
                )));
            }
            if range.start.checked_add(range.count - 1).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "polling.{name} range overflows the 16-bit address space"
                )));
            }
        }

        if self.scripts.execution_budget_ms == 0 {
            return Err(ConfigError::Invalid(
                "scripts.execution_budget_ms must be non-zero".into(),
            ));
        }
        if self.scripts.tick_ms == 0 {
            return Err(ConfigError::Invalid(
                "scripts.tick_ms must be non-zero".into(),
            ));
        }

        // WPA2 minimum; an open portal AP would accept any passerby
        if !self.network.ap_password.is_empty() && self.network.ap_password.len() < 8 {
            return Err(ConfigError::Invalid(
                "network.ap_password must be at least 8 characters".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.modbus.device_address, 1);
        assert_eq!(config.polling.poll_interval_ms, 1000);
    }

    #[test]
    fn rejects_zero_device_address() {
        let mut config = BridgeConfig::default();
        config.modbus.device_address = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_device_address_above_247() {
        let mut config = BridgeConfig::default();
        config.modbus.device_address = 248;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_register_range() {
        let mut config = BridgeConfig::default();
        config.polling.registers = RegionRange::new(0, 126);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("per-read limit"));
    }

    #[test]
    fn rejects_empty_region() {
        let mut config = BridgeConfig::default();
        config.polling.coils = RegionRange::new(0, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_range_overflowing_address_space() {
        let mut config = BridgeConfig::default();
        config.polling.coils = RegionRange::new(u16::MAX, 2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_short_ap_password() {
        let mut config = BridgeConfig::default();
        config.network.ap_password = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_retries() {
        let mut config = BridgeConfig::default();
        config.modbus.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn region_range_contains() {
        let range = RegionRange::new(10, 5);
        assert!(range.contains(10));
        assert!(range.contains(14));
        assert!(!range.contains(9));
        assert!(!range.contains(15));
    }
}
