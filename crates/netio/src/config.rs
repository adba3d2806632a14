//! Configuration management for netio.
//!
//! This module provides TOML-based configuration file loading.
//! The default configuration path is `~/.netiorc`.
//!
//! The address in effect is resolved as: command-line flag, then the
//! `NETIO_ADDR` environment variable, then the file, then the built-in
//! default.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

/// Address used when neither the file nor the environment names one.
pub const DEFAULT_ADDR: &str = "127.0.0.1:7070";

/// File name of the per-user configuration file.
pub const CONFIG_FILE_NAME: &str = ".netiorc";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("addr must be host:port with a numeric port, got {0:?}")]
    InvalidAddress(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Configuration shared by client and server mode.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listen address (server) or server address (client).
    #[serde(alias = "Addr")]
    pub addr: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILE_NAME)
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Runs before logging is set up, so it logs nothing itself.
    ///
    /// Supported variables:
    /// - NETIO_ADDR: Override the address
    /// - NETIO_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("NETIO_ADDR") {
            if !addr.is_empty() {
                self.addr = addr;
            }
        }

        if let Ok(level) = std::env::var("NETIO_LOG_LEVEL") {
            if !level.is_empty() {
                self.log_level = level;
            }
        }
    }

    /// Apply the command-line address, which wins over every other source.
    pub fn apply_cli_addr(&mut self, addr: Option<&str>) {
        if let Some(addr) = addr.filter(|a| !a.is_empty()) {
            self.addr = addr.to_string();
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let port_ok = self
            .addr
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !port_ok {
            return Err(ConfigError::InvalidAddress(self.addr.clone()));
        }

        let level = self.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from `~/.netiorc`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = Config::from_toml(r#"addr = "10.0.0.5:9000""#).unwrap();
        assert_eq!(config.addr, "10.0.0.5:9000");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_capitalized_addr_key() {
        // Older rc files spell the key `Addr`.
        let config = Config::from_toml(r#"Addr = "build-box:7070""#).unwrap();
        assert_eq!(config.addr, "build-box:7070");
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let err = Config::from_toml("addr = ").unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        assert!(Config::from_toml("addr = 7070").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/.netiorc").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(".netiorc");
        fs::write(&config_path, "addr = \"[::1]:7071\"\nlog_level = \"warn\"\n").unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(
            loaded,
            Config {
                addr: "[::1]:7071".to_string(),
                log_level: "warn".to_string(),
            }
        );
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(".netiorc");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_validate_address() {
        let mut config = Config::default();
        for good in ["localhost:22", "0.0.0.0:0", "[::]:7070"] {
            config.addr = good.to_string();
            assert!(config.validate().is_ok(), "{good} should be accepted");
        }

        for bad in ["", "localhost", ":7070", "host:port", "host:70000"] {
            config.addr = bad.to_string();
            assert_eq!(
                config.validate(),
                Err(ConfigError::InvalidAddress(bad.to_string()))
            );
        }
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_cli_addr_wins() {
        let mut config = Config::default();
        config.apply_cli_addr(Some("example.org:1"));
        assert_eq!(config.addr, "example.org:1");

        config.apply_cli_addr(None);
        config.apply_cli_addr(Some(""));
        assert_eq!(config.addr, "example.org:1");
    }

    #[test]
    #[serial]
    fn test_env_override_addr() {
        std::env::set_var("NETIO_ADDR", "10.1.1.1:7000");
        std::env::set_var("NETIO_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.addr, "10.1.1.1:7000");
        assert_eq!(config.log_level, "trace");

        // The command line still takes precedence.
        config.apply_cli_addr(Some("10.2.2.2:7000"));
        assert_eq!(config.addr, "10.2.2.2:7000");

        std::env::remove_var("NETIO_ADDR");
        std::env::remove_var("NETIO_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("NETIO_ADDR", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.addr, DEFAULT_ADDR);

        std::env::remove_var("NETIO_ADDR");
    }
}
