use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::transport::{ConnectionParams, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    pub properties: HashMap<String, String>,
}

/// A message locked for one receiver until completed, abandoned or the
/// lock expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub lock_token: Uuid,
    pub delivery_count: u32,
    pub message: CloudMessage,
}

#[async_trait]
pub trait CloudConnector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn CloudClient>, TransportError>;
}

#[async_trait]
pub trait CloudClient: Send + Sync {
    fn is_open(&self) -> bool;

    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError>;
    async fn create_topic(&self, topic: &str) -> Result<(), TransportError>;
    async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool, TransportError>;
    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        lock_duration: Duration,
    ) -> Result<(), TransportError>;

    async fn send(&self, topic: &str, message: CloudMessage) -> Result<(), TransportError>;

    /// Wait up to `max_wait` for a message; `None` when nothing arrived.
    async fn receive(
        &self,
        topic: &str,
        subscription: &str,
        max_wait: Duration,
    ) -> Result<Option<ReceivedMessage>, TransportError>;
    async fn complete(&self, topic: &str, subscription: &str, lock_token: Uuid) -> Result<(), TransportError>;
    async fn abandon(&self, topic: &str, subscription: &str, lock_token: Uuid) -> Result<(), TransportError>;
}
