//! Transactional persistence for aggregates, outbox entries and dead letters.
//!
//! A [`ChangeSet`] is everything one unit of work wants to write. Stores
//! apply it all-or-nothing, which is what makes the outbox transactional:
//! an event is staged if and only if the state change that produced it is
//! committed.

mod error;
mod in_memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use error::StoreError;
pub use in_memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::dead_letter::DeadLetterStore;
use crate::outbox::{OutboxEntry, OutboxStore};

/// Committed aggregate state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAggregate {
    pub kind: String,
    pub id: String,
    pub version: u64,
    /// JSON serialization of the aggregate.
    pub state: Vec<u8>,
}

/// Optimistically versioned aggregate write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateWrite {
    pub kind: String,
    pub id: String,
    /// Version the aggregate was loaded at; 0 for a new aggregate.
    pub expected_version: u64,
    pub version: u64,
    pub state: Vec<u8>,
}

/// Writes staged by one transaction.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub action_id: Uuid,
    pub aggregates: Vec<AggregateWrite>,
    pub outbox: Vec<OutboxEntry>,
}

impl ChangeSet {
    pub fn new(action_id: Uuid) -> Self {
        Self {
            action_id,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty() && self.outbox.is_empty()
    }
}

#[async_trait]
pub trait TransactionalStore: OutboxStore + DeadLetterStore + Send + Sync + 'static {
    /// Apply every write of the change set atomically.
    ///
    /// A version mismatch on any aggregate fails the whole set with
    /// [`StoreError::ConcurrentWrite`] and nothing is written.
    async fn apply(&self, changes: ChangeSet) -> Result<(), StoreError>;

    async fn load_aggregate(&self, kind: &str, id: &str) -> Result<Option<StoredAggregate>, StoreError>;
}
