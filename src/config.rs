//! Fog node configuration
//!
//! Defaults, overridden by an optional JSON file, overridden in turn by
//! environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::generic::DEFAULT_NAME_FILTER;
use crate::device::DEFAULT_MTU;
use crate::transport::DEFAULT_SCAN_PERIOD;

/// Path of the JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "FOG_NODE_CONFIG";
pub const SERVER_PORT_ENV: &str = "GIO_FOG_NODE_SERVER_PORT";
pub const DEVICE_SERVICE_HOST_ENV: &str = "GIO_DEVICE_SERVICE_HOST";
pub const DEVICE_SERVICE_PORT_ENV: &str = "GIO_DEVICE_SERVICE_PORT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 5003 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceServiceConfig {
    pub host: String,
    pub port: u16,
}

impl Default for DeviceServiceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub scan_period_secs: u64,
    pub mtu: u16,
    /// Recognize Smart Vases.
    pub smart_vase: bool,
    /// Name fragments the generic fallback accepts. `None` disables the
    /// fallback, an empty list accepts every peripheral.
    pub generic_name_filters: Option<Vec<String>>,
    /// Room devices are registered in on the device service.
    pub room: String,
}

impl BleConfig {
    pub fn scan_period(&self) -> Duration {
        Duration::from_secs(self.scan_period_secs)
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_period_secs: DEFAULT_SCAN_PERIOD.as_secs(),
            mtu: DEFAULT_MTU,
            smart_vase: true,
            generic_name_filters: Some(vec![DEFAULT_NAME_FILTER.to_string()]),
            room: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub device_service: DeviceServiceConfig,
    pub ble: BleConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Load from `FOG_NODE_CONFIG` if set, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                log::info!("Loading config from {}", path);
                Self::from_file(path)?
            }
            Err(_) => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(SERVER_PORT_ENV) {
            self.server.port = parse_port(SERVER_PORT_ENV, port)?;
        }
        if let Some(host) = lookup(DEVICE_SERVICE_HOST_ENV) {
            self.device_service.host = host;
        }
        if let Some(port) = lookup(DEVICE_SERVICE_PORT_ENV) {
            self.device_service.port = parse_port(DEVICE_SERVICE_PORT_ENV, port)?;
        }
        Ok(())
    }
}

fn parse_port(var: &'static str, value: String) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 5003);
        assert_eq!(config.ble.mtu, 500);
        assert_eq!(config.ble.scan_period(), Duration::from_secs(10));
        assert!(config.ble.smart_vase);
        assert_eq!(config.ble.room, "default");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"device_service": {{"host": "gio.local"}}, "ble": {{"generic_name_filters": []}}}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.device_service.host, "gio.local");
        assert_eq!(config.device_service.port, 5001);
        assert_eq!(config.ble.generic_name_filters, Some(Vec::new()));
        assert_eq!(config.server.port, 5003);
    }

    #[test]
    fn test_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(Config::from_file(file.path()), Err(ConfigError::Parse(_))));
        assert!(matches!(
            Config::from_file("/nonexistent/fog-node.json"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (SERVER_PORT_ENV, "8080"),
            (DEVICE_SERVICE_HOST_ENV, "devices.gio"),
            (DEVICE_SERVICE_PORT_ENV, " 7000 "),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.device_service.host, "devices.gio");
        assert_eq!(config.device_service.port, 7000);
    }

    #[test]
    fn test_invalid_port_env() {
        let mut config = Config::default();
        let err = config
            .apply_env(|var| (var == SERVER_PORT_ENV).then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: SERVER_PORT_ENV, .. }));
        assert_eq!(config.server.port, 5003);
    }
}
