/*!
 * Configuration management for PLMFlow.
 *
 * This module loads the binding settings from defaults, an optional file
 * and environment variables.
 */
use std::path::Path;
use std::sync::Arc;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Top level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Modem and device defaults
    #[serde(default)]
    pub modem: ModemConfig,

    /// Request queue scheduling and polling
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Modem and device defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Port the modem is attached to, used as every device's default port
    #[serde(default = "default_port")]
    pub port: String,

    /// Poll interval given to new devices, in milliseconds; <= 0 disables polling
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: i64,

    /// A device that has not answered a poll for this long is reported as dead
    #[serde(default = "default_dead_device_timeout_ms")]
    pub dead_device_timeout_ms: i64,
}

/// Request queue scheduling and polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long the drain task parks when no device has queued work
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,

    /// How often the poller checks devices for due polls
    #[serde(default = "default_poll_tick_ms")]
    pub poll_tick_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            default_poll_interval_ms: default_poll_interval_ms(),
            dead_device_timeout_ms: default_dead_device_timeout_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_wait_ms: default_idle_wait_ms(),
            poll_tick_ms: default_poll_tick_ms(),
        }
    }
}

fn default_app_name() -> String {
    "plmflow".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_poll_interval_ms() -> i64 {
    300_000
}

fn default_dead_device_timeout_ms() -> i64 {
    3_600_000
}

fn default_idle_wait_ms() -> u64 {
    1_000
}

fn default_poll_tick_ms() -> u64 {
    2_000
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let default_config = Config::default();
        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "plmflow");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.modem.default_poll_interval_ms, 300_000);
        assert_eq!(config.scheduler.idle_wait_ms, 1_000);
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "plmflow");
        assert_eq!(config.modem.port, "/dev/ttyUSB0");
    }

    #[test_log::test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("plmflow.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [modem]
                port = "/dev/ttyS3"
                default_poll_interval_ms = 0

                [logging]
                level = "debug"
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.modem.port, "/dev/ttyS3");
        assert_eq!(config.modem.default_poll_interval_ms, 0);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.scheduler.poll_tick_ms, 2_000);

        Ok(())
    }

    #[test_log::test]
    fn test_missing_config_file_falls_back_to_defaults() -> Result<()> {
        let config = ConfigBuilder::new()
            .with_config_file("/nonexistent/plmflow.toml")
            .build()?;
        assert_eq!(config.general.environment, "development");
        Ok(())
    }

    #[test_log::test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("PLMFLOWTEST__MODEM__PORT", "/dev/ttyACM1");
        env::set_var("PLMFLOWTEST__SCHEDULER__IDLE_WAIT_MS", "250");

        let config = ConfigBuilder::new()
            .with_environment_prefix("plmflowtest")
            .build()?;

        assert_eq!(config.modem.port, "/dev/ttyACM1");
        assert_eq!(config.scheduler.idle_wait_ms, 250);

        env::remove_var("PLMFLOWTEST__MODEM__PORT");
        env::remove_var("PLMFLOWTEST__SCHEDULER__IDLE_WAIT_MS");

        Ok(())
    }

    #[test]
    fn test_shared_config() {
        let shared = SharedConfig::new(Config::default());
        let shared2 = shared.clone();
        assert_eq!(shared2.get().general.app_name, "plmflow");
    }
}
