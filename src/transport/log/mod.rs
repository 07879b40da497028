//! Partitioned log brokers (Kafka model).
//!
//! A topic is a set of append-only partitions. A consumer group owns one
//! committed offset per partition, created at the log end when the group
//! first joins, and partitions are spread across the group's live members.
//! Redelivery is re-fetching from the last committed offset.

mod client;
#[cfg(feature = "kafka")]
mod kafka;
mod memory;
mod transport;

pub use client::{Assignment, LogClient, LogConnector, LogEntry, LogRecord};
#[cfg(feature = "kafka")]
pub use kafka::KafkaConnector;
pub use memory::MemoryLogBroker;
pub use transport::LogTransport;
