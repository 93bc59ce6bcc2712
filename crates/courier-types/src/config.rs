//! Bus configuration with defaults, loadable from TOML.

use crate::envelope::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Per-context bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Protocol version stamped on outgoing requests and required on inbound ones.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    /// Timeout applied to a send when the caller does not set one.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Per-target timeout applied to a broadcast when the caller does not set one.
    #[serde(default = "default_timeout_ms")]
    pub broadcast_timeout_ms: u64,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_timeout_ms() -> u64 {
    15_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            default_timeout_ms: default_timeout_ms(),
            broadcast_timeout_ms: default_timeout_ms(),
        }
    }
}

impl BusConfig {
    /// Parse from a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.broadcast_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "broadcast_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Default deadline for a single call.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Default per-target deadline for a broadcast.
    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.default_timeout(), Duration::from_secs(15));
        assert_eq!(config.broadcast_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = BusConfig::from_toml_str("default_timeout_ms = 500").unwrap();
        assert_eq!(config.default_timeout_ms, 500);
        assert_eq!(config.broadcast_timeout_ms, 15_000);
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = BusConfig::from_toml_str("default_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "protocol_version = 2\nbroadcast_timeout_ms = 250").unwrap();
        let config = BusConfig::load(file.path()).unwrap();
        assert_eq!(config.protocol_version, 2);
        assert_eq!(config.broadcast_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_load_missing_file() {
        let err = BusConfig::load(Path::new("/nonexistent/courier.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
