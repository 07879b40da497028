//! `tracing` subscriber setup for hosts that do not install their own.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

mod defaults {
    pub fn filter() -> String {
        "info".to_string()
    }

    pub fn ansi() -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set.
    #[serde(default = "defaults::filter")]
    pub filter: String,
    #[serde(default = "defaults::ansi")]
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: defaults::filter(),
            ansi: defaults::ansi(),
        }
    }
}

impl LoggingConfig {
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new(defaults::filter()))
    }
}

/// Install a global fmt subscriber. Returns false if one was already set.
pub fn init(config: &LoggingConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_ansi(config.ansi)
        .try_init()
        .is_ok()
}
