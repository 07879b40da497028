use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::{ConnectionParams, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Times the broker has handed this message out, this delivery included.
    pub delivery_count: u32,
    pub message: AmqpMessage,
}

/// Deliveries pushed to one consumer. Closes when the channel does.
pub type DeliveryStream = mpsc::UnboundedReceiver<AmqpDelivery>;

#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn AmqpChannel>, TransportError>;
}

/// The subset of channel operations the transport uses.
///
/// Operations on a channel whose connection dropped fail with
/// [`TransportError::ConnectionLost`].
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_exists(&self, exchange: &str) -> Result<bool, TransportError>;
    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError>;
    async fn declare_queue(&self, queue: &str) -> Result<(), TransportError>;
    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), TransportError>;

    async fn publish(&self, exchange: &str, message: AmqpMessage) -> Result<(), TransportError>;

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream, TransportError>;
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;
    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;
}
