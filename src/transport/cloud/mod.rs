//! Cloud queueing services with topics and named subscriptions.
//!
//! Each consumer group is a named subscription on the topic. Receivers pull
//! messages under a peek-lock; a message is completed on success and
//! abandoned (or left to its lock expiring) for redelivery.

mod client;
mod memory;
mod transport;

pub use client::{CloudClient, CloudConnector, CloudMessage, ReceivedMessage};
pub use memory::MemoryCloudBroker;
pub use transport::CloudTransport;
