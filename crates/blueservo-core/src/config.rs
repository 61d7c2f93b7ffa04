//! Unified configuration loading.
//!
//! Configuration is read from a TOML file (every field has a default), then
//! overridden from environment variables, then validated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::state::DeviceIdentity;

/// Default file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "blueservo.toml";

/// GATT identifiers of the servo firmware (Nordic UART service layout).
pub mod gatt {
    use uuid::Uuid;

    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
    pub const WRITE_CHARACTERISTIC_UUID: Uuid =
        Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
    pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
        Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
}

/// Default timeouts in milliseconds.
pub mod timeouts {
    pub const SCAN_MS: u64 = 10_000;
    pub const CONNECT_MS: u64 = 5_000;
    pub const DISCOVERY_MS: u64 = 2_000;
    pub const NOTIFY_MS: u64 = 5_000;
}

/// Environment variable names.
pub mod env_vars {
    pub const PERIPHERAL_ID: &str = "BLUESERVO_PERIPHERAL_ID";
    pub const STORAGE_PATH: &str = "BLUESERVO_STORAGE_PATH";
    pub const STORAGE_BACKEND: &str = "BLUESERVO_STORAGE_BACKEND";
    pub const TRANSPORT: &str = "BLUESERVO_TRANSPORT";
    pub const SCAN_TIMEOUT_MS: &str = "BLUESERVO_SCAN_TIMEOUT_MS";
    pub const CONNECT_TIMEOUT_MS: &str = "BLUESERVO_CONNECT_TIMEOUT_MS";
    pub const LOG_JSON: &str = "BLUESERVO_LOG_JSON";
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub device: DeviceConfig,
    pub timeouts: TimeoutConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    pub transport: TransportConfig,
}

/// Target peripheral and its GATT layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Peripheral id or hardware address
    pub peripheral_id: String,
    pub service_uuid: Uuid,
    pub write_characteristic_uuid: Uuid,
    pub notify_characteristic_uuid: Uuid,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            peripheral_id: String::new(),
            service_uuid: gatt::SERVICE_UUID,
            write_characteristic_uuid: gatt::WRITE_CHARACTERISTIC_UUID,
            notify_characteristic_uuid: gatt::NOTIFY_CHARACTERISTIC_UUID,
        }
    }
}

impl DeviceConfig {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.peripheral_id.clone())
    }
}

/// Phase deadlines, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub scan_ms: u64,
    pub connect_ms: u64,
    /// Characteristic resolution, counted after service discovery
    pub discovery_ms: u64,
    /// Wait for the confirming status notification
    pub notify_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            scan_ms: timeouts::SCAN_MS,
            connect_ms: timeouts::CONNECT_MS,
            discovery_ms: timeouts::DISCOVERY_MS,
            notify_ms: timeouts::NOTIFY_MS,
        }
    }
}

impl TimeoutConfig {
    pub fn scan(&self) -> Duration {
        Duration::from_millis(self.scan_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn discovery(&self) -> Duration {
        Duration::from_millis(self.discovery_ms)
    }

    pub fn notify(&self) -> Duration {
        Duration::from_millis(self.notify_ms)
    }
}

/// Reconciliation behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Treat "no recorded state" as already matching the desired state.
    pub assume_absent_satisfied: bool,
    /// Keep the session open between exchanges. When false the peripheral is
    /// disconnected after every exchange.
    pub keep_alive: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            assume_absent_satisfied: false,
            keep_alive: true,
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Redb,
    Memory,
}

impl std::str::FromStr for StorageBackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redb" => Ok(Self::Redb),
            "memory" => Ok(Self::Memory),
            other => Err(Error::Config(format!("unknown storage backend: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    pub path: PathBuf,
    /// How often the durable request queue is checked for new entries
    pub queue_poll_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Redb,
            path: PathBuf::from("data/blueservo.redb"),
            queue_poll_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }
}

/// Radio transport selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Bluetooth LE through the host adapter
    #[default]
    Ble,
    /// In-process simulated servo
    Simulated,
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ble" => Ok(Self::Ble),
            "simulated" => Ok(Self::Simulated),
            other => Err(Error::Config(format!("unknown transport: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
}

impl ServoConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from `path` (or `blueservo.toml` when present),
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    Self::default()
                }
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (normally the process environment).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup(env_vars::PERIPHERAL_ID) {
            self.device.peripheral_id = id;
        }
        if let Some(path) = lookup(env_vars::STORAGE_PATH) {
            self.storage.path = PathBuf::from(path);
        }
        if let Some(backend) = lookup(env_vars::STORAGE_BACKEND) {
            self.storage.backend = backend.parse()?;
        }
        if let Some(kind) = lookup(env_vars::TRANSPORT) {
            self.transport.kind = kind.parse()?;
        }
        if let Some(ms) = lookup(env_vars::SCAN_TIMEOUT_MS) {
            self.timeouts.scan_ms = parse_millis(env_vars::SCAN_TIMEOUT_MS, &ms)?;
        }
        if let Some(ms) = lookup(env_vars::CONNECT_TIMEOUT_MS) {
            self.timeouts.connect_ms = parse_millis(env_vars::CONNECT_TIMEOUT_MS, &ms)?;
        }
        Ok(())
    }

    /// Check that the configuration can drive a session.
    pub fn validate(&self) -> Result<()> {
        if self.device.peripheral_id.trim().is_empty() {
            return Err(Error::Config(format!(
                "device.peripheral_id is required (or set {})",
                env_vars::PERIPHERAL_ID
            )));
        }
        if self.device.write_characteristic_uuid == self.device.notify_characteristic_uuid {
            return Err(Error::Config(
                "write and notify characteristics must differ".to_string(),
            ));
        }
        let t = &self.timeouts;
        if t.scan_ms == 0 || t.connect_ms == 0 || t.discovery_ms == 0 || t.notify_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        if self.storage.queue_poll_interval_ms == 0 {
            return Err(Error::Config(
                "storage.queue_poll_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be milliseconds, got {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_firmware() {
        let config = ServoConfig::default();
        assert_eq!(config.timeouts.scan_ms, 10_000);
        assert_eq!(config.timeouts.connect_ms, 5_000);
        assert_eq!(config.timeouts.discovery_ms, 2_000);
        assert_eq!(
            config.device.service_uuid.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert!(config.sync.keep_alive);
        assert!(!config.sync.assume_absent_satisfied);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServoConfig::from_toml_str(
            r#"
            [device]
            peripheral_id = "c8:fd:19:0a:11:22"

            [timeouts]
            scan_ms = 3000

            [transport]
            kind = "simulated"
            "#,
        )
        .unwrap();
        assert_eq!(config.device.peripheral_id, "c8:fd:19:0a:11:22");
        assert_eq!(config.timeouts.scan_ms, 3000);
        assert_eq!(config.timeouts.connect_ms, timeouts::CONNECT_MS);
        assert_eq!(config.transport.kind, TransportKind::Simulated);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (env_vars::PERIPHERAL_ID, "servo-1"),
            (env_vars::STORAGE_BACKEND, "memory"),
            (env_vars::CONNECT_TIMEOUT_MS, "750"),
        ]
        .into_iter()
        .collect();

        let mut config = ServoConfig::default();
        config
            .apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.device.peripheral_id, "servo-1");
        assert_eq!(config.storage.backend, StorageBackendKind::Memory);
        assert_eq!(config.timeouts.connect_ms, 750);
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let mut config = ServoConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == env_vars::SCAN_TIMEOUT_MS).then(|| "soon".into()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_requires_peripheral() {
        let err = ServoConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("peripheral_id"));
    }
}
