//! Exchange/queue brokers (AMQP 0-9-1 model).
//!
//! Each topic is a fanout exchange; each consumer group is a durable queue
//! named `{topic}.{group}` bound to it. Redelivery is nack with requeue.

mod client;
mod memory;
mod transport;

pub use client::{AmqpChannel, AmqpConnector, AmqpDelivery, AmqpMessage, DeliveryStream};
pub use memory::MemoryAmqpBroker;
pub use transport::{queue_name, AmqpTransport};
