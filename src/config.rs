//! File configuration for a relay process.
//!
//! ```toml
//! [transport]
//! backend = "amqp"
//! address = "amqp://broker:5672"
//! auto_create_topics = false
//!
//! [transport.reconnect]
//! max_delay_ms = 30000
//!
//! [dispatcher]
//! poll_interval_ms = 250
//! max_retry_delay_ms = 30000
//!
//! [listener]
//! max_retries = 3
//!
//! [logging]
//! filter = "relay_rust=debug,info"
//! ```
//!
//! Every section and field is optional.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::listener::ListenerConfig;
use crate::logging::LoggingConfig;
use crate::outbox::DispatcherConfig;
use crate::transport::TransportConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RelayConfig {
    /// Parse and validate.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.dispatcher.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.dispatcher.retry_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.retry_delay_ms must be greater than zero".into(),
            ));
        }
        if self.dispatcher.dispatcher_id.trim().is_empty() {
            return Err(ConfigError::Invalid("dispatcher.dispatcher_id must not be empty".into()));
        }
        Ok(())
    }
}
