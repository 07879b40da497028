//! Messaging transports: one publish/subscribe contract, several brokers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 MessagingTransport (trait)                   │
//! │  publish(topic, msg) / subscribe(topic, group, handler)     │
//! │  unsubscribe(subscription) / dispose()                      │
//! └─────────────────────────────────────────────────────────────┘
//!          │               │               │               │
//!          ▼               ▼               ▼               ▼
//!   ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌────────────┐
//!   │ InProcess  │  │    Amqp    │  │    Log     │  │   Cloud    │
//!   │  (queues)  │  │ (exchange, │  │(partitions,│  │  (topics,  │
//!   │            │  │  queues)   │  │  offsets)  │  │ peek-lock) │
//!   └────────────┘  └────────────┘  └────────────┘  └────────────┘
//!                          │               │               │
//!                          └───── ConnectionManager ───────┘
//!                              (reconnect with backoff)
//! ```
//!
//! Every backend gives the same guarantees:
//!
//! - subscribing provisions the group's durable broker state before it
//!   returns, and that state outlives the subscription;
//! - a handler error or a missed acknowledgement leaves redelivery to the
//!   broker;
//! - consumers of one group on different transport instances compete, each
//!   message reaching one of them;
//! - networked backends reconnect on connection loss and resume every live
//!   subscription.
//!
//! Backends are chosen at runtime with [`build`] from a [`TransportConfig`]
//! and the [`Connectors`] registered by the host.

pub mod amqp;
pub mod cloud;
mod config;
mod connection;
mod error;
mod factory;
mod handler;
mod in_process;
pub mod log;
mod message;
mod subscription;
mod topic_cache;

pub use config::{AmqpSettings, Backend, CloudSettings, ConnectionParams, LogSettings, ReconnectConfig, TransportConfig};
pub use error::TransportError;
pub use factory::{build, Connectors};
pub use handler::{HandlerError, MessageHandler};
pub use in_process::{InProcessBroker, InProcessTransport};
pub use message::Message;
pub use subscription::{Subscription, SubscriptionKey};

use std::sync::Arc;

use async_trait::async_trait;

#[async_trait]
pub trait MessagingTransport: Send + Sync {
    fn backend(&self) -> Backend;

    /// Publish to every group subscribed to `topic`. Returns once the broker
    /// has accepted the message.
    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError>;

    /// Start consuming `topic` as a member of `group`.
    ///
    /// The group's broker-side state exists when this returns, so every
    /// message published afterwards reaches the group even while no member
    /// is consuming.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, TransportError>;

    /// Stop consuming. The group's broker-side state is kept.
    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), TransportError> {
        subscription.dispose().await
    }

    /// Dispose every subscription and close the connection. Idempotent.
    async fn dispose(&self) -> Result<(), TransportError>;
}
