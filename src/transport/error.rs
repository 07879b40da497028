use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Connection(String),
    #[error("connection to broker lost")]
    ConnectionLost,
    #[error("topic '{topic}' does not exist and auto-creation is disabled")]
    TopicNotFound { topic: String },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("a subscription for topic '{topic}' and group '{group}' is already live")]
    AlreadySubscribed { topic: String, group: String },
    #[error("transport has been disposed")]
    Disposed,
    #[error("transport configuration error: {0}")]
    Configuration(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("transport state poisoned during {0}")]
    Poisoned(&'static str),
}

impl TransportError {
    /// The connection is gone and must be re-established before retrying.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ConnectionLost | TransportError::Connection(_))
    }
}
