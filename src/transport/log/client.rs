use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::transport::{ConnectionParams, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Records with the same key land on the same partition.
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub partition: u32,
    pub offset: u64,
    pub record: LogRecord,
}

/// Partitions owned by a group member in one generation of the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub generation: u64,
    pub partitions: Vec<u32>,
}

#[async_trait]
pub trait LogConnector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn LogClient>, TransportError>;
}

#[async_trait]
pub trait LogClient: Send + Sync {
    fn is_open(&self) -> bool;

    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError>;
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), TransportError>;

    /// Append a record; returns its partition and offset.
    async fn produce(&self, topic: &str, record: LogRecord) -> Result<(u32, u64), TransportError>;

    /// Join (or rejoin) a group. A group that does not exist yet starts at
    /// the current end of every partition.
    async fn join_group(&self, topic: &str, group: &str, member_id: &str) -> Result<Assignment, TransportError>;
    async fn assignment(&self, topic: &str, group: &str, member_id: &str) -> Result<Assignment, TransportError>;
    async fn leave_group(&self, topic: &str, group: &str, member_id: &str) -> Result<(), TransportError>;

    /// Records of `partition` from `offset` on, as seen by `group`'s member
    /// on this client.
    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        offset: u64,
        max_records: usize,
    ) -> Result<Vec<LogEntry>, TransportError>;
    async fn committed(&self, topic: &str, group: &str, partition: u32) -> Result<u64, TransportError>;
    async fn commit(&self, topic: &str, group: &str, partition: u32, offset: u64) -> Result<(), TransportError>;
}
