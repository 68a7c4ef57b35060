//! Configuration System using Figment
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `LABRAD_`
//! 2. A TOML configuration file
//!
//! Every section has defaults, so an empty file (or none at all) yields a
//! valid configuration.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! LABRAD_CLIENT__NAME="Scan Runner"
//! LABRAD_CLIENT__REQUEST_TIMEOUT_MS=500
//! LABRAD_LOGGING__LEVEL=debug
//! ```
//!
//! Sections and keys are separated by a double underscore so that keys
//! containing `_` survive.
//!
//! # Example
//!
//! ```no_run
//! use rust_labrad::config::LabradConfig;
//!
//! let config = LabradConfig::load_from("labrad.toml")?;
//! println!("Client: {}", config.client.name);
//! # Ok::<(), rust_labrad::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be parsed
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values parsed but are out of range
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabradConfig {
    /// In-process manager settings
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Client connection settings
    #[serde(default)]
    pub client: ClientConfig,
    /// Tracing output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Request queue depth per server
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Name reported for connections
    #[serde(default = "default_client_name")]
    pub name: String,
    /// Time to wait for a reply before giving up
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_queue_capacity() -> usize {
    100
}

fn default_client_name() -> String {
    "rust_labrad".to_string()
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl ManagerConfig {
    /// Reject settings the manager cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "manager.queue_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl ClientConfig {
    /// Request timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl LabradConfig {
    /// Load defaults overridden by `LABRAD_` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::extract(Self::figment())
    }

    /// Load a TOML file, then apply `LABRAD_` environment variables.
    ///
    /// A missing file is not an error; its values simply fall back to
    /// defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("LABRAD_").split("__")),
        )
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("LABRAD_").split("__"))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Queue capacity and request timeout are non-zero
    /// - Client name is not empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        self.manager.validate()?;

        if self.client.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "client.request_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.client.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "client.name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
