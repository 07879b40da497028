use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::TransportError;

mod defaults {
    pub fn address() -> String {
        "memory://local".to_string()
    }

    pub fn auto_create_topics() -> bool {
        true
    }

    pub fn topic_cache_ttl_secs() -> u64 {
        600
    }

    pub fn operation_timeout_ms() -> u64 {
        5_000
    }

    pub fn ack_timeout_ms() -> u64 {
        30_000
    }

    pub fn redelivery_delay_ms() -> u64 {
        100
    }

    pub fn initial_delay_ms() -> u64 {
        100
    }

    pub fn max_delay_ms() -> u64 {
        10_000
    }

    pub fn multiplier() -> f64 {
        2.0
    }

    pub fn jitter() -> f64 {
        0.2
    }

    pub fn prefetch() -> u16 {
        1
    }

    pub fn partitions() -> u32 {
        60
    }

    pub fn poll_interval_ms() -> u64 {
        20
    }

    pub fn max_poll_records() -> usize {
        16
    }

    pub fn lock_duration_ms() -> u64 {
        60_000
    }

    pub fn receive_wait_ms() -> u64 {
        250
    }
}

/// Broker family a transport talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    InProcess,
    /// Exchange/queue broker: fanout exchange per topic, durable queue per group.
    Amqp,
    /// Partitioned log with consumer-group offsets.
    Log,
    /// Topic/subscription service with peek-lock receive.
    Cloud,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::InProcess => "in_process",
            Backend::Amqp => "amqp",
            Backend::Log => "log",
            Backend::Cloud => "cloud",
        };
        f.write_str(name)
    }
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "defaults::initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "defaults::multiplier")]
    pub multiplier: f64,
    /// Fraction of each delay randomized in either direction.
    #[serde(default = "defaults::jitter")]
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: defaults::initial_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            multiplier: defaults::multiplier(),
            jitter: defaults::jitter(),
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmqpSettings {
    /// Unacknowledged deliveries per consumer; 0 means unlimited.
    #[serde(default = "defaults::prefetch")]
    pub prefetch: u16,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            prefetch: defaults::prefetch(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    /// Partitions for auto-created topics. Competing consumers only get even
    /// shares when the group size divides this; 60 covers groups of 1 to 6.
    #[serde(default = "defaults::partitions")]
    pub partitions: u32,
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "defaults::max_poll_records")]
    pub max_poll_records: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            partitions: defaults::partitions(),
            poll_interval_ms: defaults::poll_interval_ms(),
            max_poll_records: defaults::max_poll_records(),
        }
    }
}

impl LogSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSettings {
    /// Peek-lock duration of auto-created subscriptions.
    #[serde(default = "defaults::lock_duration_ms")]
    pub lock_duration_ms: u64,
    /// Longest a receive call waits for a message.
    #[serde(default = "defaults::receive_wait_ms")]
    pub receive_wait_ms: u64,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            lock_duration_ms: defaults::lock_duration_ms(),
            receive_wait_ms: defaults::receive_wait_ms(),
        }
    }
}

impl CloudSettings {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }
}

/// What a connector needs to reach a broker.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "defaults::address")]
    pub address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Create missing topics instead of failing with `TopicNotFound`.
    #[serde(default = "defaults::auto_create_topics")]
    pub auto_create_topics: bool,
    #[serde(default = "defaults::topic_cache_ttl_secs")]
    pub topic_cache_ttl_secs: u64,
    /// Bound on publish and on subscription provisioning.
    #[serde(default = "defaults::operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// A handler that has not returned within this is treated as a failure.
    #[serde(default = "defaults::ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Pause before a failed message is handed back to the broker.
    #[serde(default = "defaults::redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub amqp: AmqpSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub cloud: CloudSettings,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            address: defaults::address(),
            username: None,
            password: None,
            auto_create_topics: defaults::auto_create_topics(),
            topic_cache_ttl_secs: defaults::topic_cache_ttl_secs(),
            operation_timeout_ms: defaults::operation_timeout_ms(),
            ack_timeout_ms: defaults::ack_timeout_ms(),
            redelivery_delay_ms: defaults::redelivery_delay_ms(),
            reconnect: ReconnectConfig::default(),
            amqp: AmqpSettings::default(),
            log: LogSettings::default(),
            cloud: CloudSettings::default(),
        }
    }
}

impl TransportConfig {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    pub fn topic_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.topic_cache_ttl_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            address: self.address.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_auto_create_topics(mut self, enabled: bool) -> Self {
        self.auto_create_topics = enabled;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        let invalid = |reason: &str| Err(TransportError::Configuration(reason.to_string()));
        if self.address.trim().is_empty() {
            return invalid("address must not be empty");
        }
        if self.operation_timeout_ms == 0 {
            return invalid("operation_timeout_ms must be greater than zero");
        }
        if self.ack_timeout_ms == 0 {
            return invalid("ack_timeout_ms must be greater than zero");
        }
        if self.reconnect.initial_delay_ms == 0 {
            return invalid("reconnect.initial_delay_ms must be greater than zero");
        }
        if self.reconnect.multiplier < 1.0 {
            return invalid("reconnect.multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return invalid("reconnect.jitter must be between 0.0 and 1.0");
        }
        if self.log.partitions == 0 {
            return invalid("log.partitions must be greater than zero");
        }
        if self.log.poll_interval_ms == 0 {
            return invalid("log.poll_interval_ms must be greater than zero");
        }
        if self.cloud.receive_wait_ms == 0 {
            return invalid("cloud.receive_wait_ms must be greater than zero");
        }
        Ok(())
    }
}
