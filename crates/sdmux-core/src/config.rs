//! Runtime configuration.
//!
//! Configuration can be built in code, parsed from YAML, or loaded through the
//! `config` crate so that `SDMUX__*` environment variables override values
//! from the file.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for the discovery runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Whether new operations ask for the pooled provider connection
    #[serde(default = "default_share_connection")]
    pub share_connection: bool,

    /// Retry advertisements with an empty name using the local hostname when
    /// the provider rejects the empty name
    #[serde(default = "default_hostname_fallback")]
    pub hostname_fallback: bool,

    /// Readiness events fetched per wake of the poll loop
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Name prefix of the poll loop threads (suffixed with the generation)
    #[serde(default = "default_poll_thread_name")]
    pub poll_thread_name: String,

    /// Name of the callback dispatch thread
    #[serde(default = "default_dispatch_thread_name")]
    pub dispatch_thread_name: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            share_connection: default_share_connection(),
            hostname_fallback: default_hostname_fallback(),
            max_events: default_max_events(),
            poll_thread_name: default_poll_thread_name(),
            dispatch_thread_name: default_dispatch_thread_name(),
            logging: LoggingConfig::default(),
        }
    }
}

impl MuxConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::InvalidFormat {
            reason: e.to_string(),
        })
    }

    /// Loads configuration from an optional file with `SDMUX__*` environment
    /// overrides, e.g. `SDMUX__SHARE_CONNECTION=false`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("SDMUX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let loaded: Self = config
            .try_deserialize()
            .map_err(|e| ConfigError::InvalidFormat {
                reason: e.to_string(),
            })?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_events == 0 {
            return Err(ConfigError::invalid_value("max_events", "cannot be 0"));
        }

        if self.poll_thread_name.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "poll_thread_name",
                "cannot be empty",
            ));
        }

        if self.dispatch_thread_name.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "dispatch_thread_name",
                "cannot be empty",
            ));
        }

        self.logging.validate()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON formatted log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => Ok(()),
            other => Err(ConfigError::invalid_value(
                "logging.level",
                format!("unknown level '{}'", other),
            )),
        }
    }
}

fn default_share_connection() -> bool {
    true
}

fn default_hostname_fallback() -> bool {
    true
}

fn default_max_events() -> usize {
    64
}

fn default_poll_thread_name() -> String {
    "sdmux-poll".to_string()
}

fn default_dispatch_thread_name() -> String {
    "sdmux-dispatch".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
