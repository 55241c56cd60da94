//! # Configuration Management Module
//!
//! Persistent application settings stored in platform-appropriate locations.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - `enable_autoconnect`: Connect to the first listed sensor after a scan
//! - `priority_device_id`: Sensor listed first after a scan
//! - `scan_timeout_secs`, `connect_timeout_secs`: BLE operation bounds
//! - `service_uuid`, `characteristic_uuid`: GATT target of the EMG stream
//! - `sample_window_len`, `synthetic_interval_ms`: live sample display
//! - `[health]`: refresh interval, query timeout and placeholder policy
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/fitsense/config.toml
//! - Linux: ~/.config/fitsense/config.toml
//! - Windows: %APPDATA%\fitsense\config.toml
//!
//! Every field has a default, so a partial file loads and missing keys keep
//! their defaults.

use crate::error::ConfigError;
use crate::gatt::{TargetUuids, UUID_SENSOR_CHARACTERISTIC, UUID_SENSOR_SERVICE};
use crate::health::HealthSettings;
use crate::sensor::DeviceSettings;
use crate::timeseries::DEFAULT_WINDOW_LEN;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enable_autoconnect: bool,
    pub priority_device_id: Option<String>,
    pub scan_timeout_secs: u64,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub sample_window_len: usize,
    pub synthetic_interval_ms: u64,
    pub connect_timeout_secs: u64,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub refresh_interval_secs: u64,
    pub query_timeout_secs: u64,
    /// Exercise minutes shown when no activity data exists; negative disables it
    pub exercise_placeholder_minutes: f64,
    pub periodic_refresh: bool,
    /// Record a synthetic workout at startup
    pub seed_synthetic_activity: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_autoconnect: false,
            priority_device_id: None,
            scan_timeout_secs: 5,
            service_uuid: UUID_SENSOR_SERVICE,
            characteristic_uuid: UUID_SENSOR_CHARACTERISTIC,
            sample_window_len: DEFAULT_WINDOW_LEN,
            synthetic_interval_ms: 100,
            connect_timeout_secs: 10,
            health: HealthConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30,
            query_timeout_secs: 10,
            exercise_placeholder_minutes: 30.0,
            periodic_refresh: true,
            seed_synthetic_activity: false,
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fitsense")
            .join("config.toml")
    }

    /// Load config from file, or create default if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents).map_err(ConfigError::ParseFailed)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, create default
                let config = Self::default();
                config.save_to(path)?;
                log::info!("Created default config at {}", path.display());
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save config to file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs.max(1))
    }

    /// Device manager settings derived from this config
    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            target: TargetUuids {
                service: self.service_uuid,
                characteristic: self.characteristic_uuid,
            },
            window_len: self.sample_window_len,
            synthetic_interval: Duration::from_millis(self.synthetic_interval_ms.max(1)),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
        }
    }

    /// Aggregator settings derived from this config
    pub fn health_settings(&self) -> HealthSettings {
        let placeholder = self.health.exercise_placeholder_minutes;
        HealthSettings {
            refresh_interval: Duration::from_secs(self.health.refresh_interval_secs.max(1)),
            query_timeout: Duration::from_secs(self.health.query_timeout_secs.max(1)),
            exercise_placeholder: (placeholder >= 0.0).then_some(placeholder),
            ..HealthSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.enable_autoconnect);
        assert_eq!(config.priority_device_id, None);
        assert_eq!(config.scan_timeout_secs, 5);
        assert_eq!(config.sample_window_len, 20);
        assert_eq!(config.health.refresh_interval_secs, 30);
        assert_eq!(config.health.exercise_placeholder_minutes, 30.0);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config {
            enable_autoconnect: true,
            priority_device_id: Some("AA:BB:CC:DD:EE:FF".to_string()),
            ..Config::default()
        };

        let toml_str = toml::to_string(&config).expect("Failed to serialize");
        assert!(toml_str.contains("enable_autoconnect = true"));
        assert!(toml_str.contains("priority_device_id = \"AA:BB:CC:DD:EE:FF\""));
        assert!(toml_str.contains("12345678-1234-5678-1234-567812345678"));
        assert!(toml_str.contains("[health]"));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let toml_str = r#"
            enable_autoconnect = true
            scan_timeout_secs = 8

            [health]
            periodic_refresh = false
        "#;

        let config: Config = toml::from_str(toml_str).expect("Failed to deserialize");
        assert!(config.enable_autoconnect);
        assert_eq!(config.scan_timeout(), Duration::from_secs(8));
        assert_eq!(config.connect_timeout_secs, 10);
        assert!(!config.health.periodic_refresh);
        assert_eq!(config.health.query_timeout_secs, 10);
    }

    #[test]
    fn test_invalid_config_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "scan_timeout_secs = \"soon\"").expect("write");

        assert!(matches!(Config::load_from(&path), Err(ConfigError::ParseFailed(_))));
    }

    #[test]
    fn test_config_load_creates_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).expect("Failed to load config");
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_config_round_trip_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.sample_window_len = 40;
        config.health.exercise_placeholder_minutes = -1.0;

        config.save_to(&path).expect("save");
        let loaded = Config::load_from(&path).expect("load");
        assert_eq!(loaded, config);
        assert_eq!(loaded.health_settings().exercise_placeholder, None);
        assert_eq!(loaded.device_settings().window_len, 40);
    }

    #[test]
    fn test_derived_settings() {
        let config = Config::default();
        let device = config.device_settings();
        assert_eq!(device.target, TargetUuids::default());
        assert_eq!(device.synthetic_interval, Duration::from_millis(100));
        assert_eq!(device.connect_timeout, Duration::from_secs(10));

        let health = config.health_settings();
        assert_eq!(health.refresh_interval, Duration::from_secs(30));
        assert_eq!(health.exercise_placeholder, Some(30.0));
    }

    #[test]
    fn test_zero_timeouts_are_clamped() {
        let mut config = Config::default();
        config.scan_timeout_secs = 0;
        config.connect_timeout_secs = 0;
        config.synthetic_interval_ms = 0;
        config.health.query_timeout_secs = 0;
        config.health.refresh_interval_secs = 0;

        assert_eq!(config.scan_timeout(), Duration::from_secs(1));
        let device = config.device_settings();
        assert_eq!(device.connect_timeout, Duration::from_secs(1));
        assert_eq!(device.synthetic_interval, Duration::from_millis(1));

        let health = config.health_settings();
        assert_eq!(health.query_timeout, Duration::from_secs(1));
        assert_eq!(health.refresh_interval, Duration::from_secs(1));
    }
}
