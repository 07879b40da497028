use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{ChangeSet, StoreError, StoredAggregate, TransactionalStore};
use crate::dead_letter::{DeadLetterEntry, DeadLetterStore};
use crate::outbox::{OutboxEntry, OutboxStore};

type AggregateKey = (String, String);

#[derive(Default)]
struct Tables {
    aggregates: HashMap<AggregateKey, StoredAggregate>,
    /// Insertion order; ties on `added_at` dispatch in this order.
    outbox: Vec<OutboxEntry>,
    dead_letters: Vec<DeadLetterEntry>,
}

impl Tables {
    fn undo(&mut self, undo: Vec<(AggregateKey, Option<StoredAggregate>)>) {
        for (key, previous) in undo.into_iter().rev() {
            match previous {
                Some(previous) => {
                    self.aggregates.insert(key, previous);
                }
                None => {
                    self.aggregates.remove(&key);
                }
            }
        }
    }

    fn held_entry_mut(&mut self, claim: &OutboxEntry) -> Result<&mut OutboxEntry, StoreError> {
        let entry = self
            .outbox
            .iter_mut()
            .find(|entry| entry.id == claim.id)
            .ok_or(StoreError::missing(claim.id))?;
        if !entry.is_publishing {
            return Err(StoreError::unclaimed(claim.id));
        }
        if !entry.is_held_by(claim) {
            return Err(StoreError::superseded(claim.id));
        }
        Ok(entry)
    }
}

/// In-process store backed by `RwLock`-guarded tables.
///
/// Clones share the same tables, so one clone can be handed to the
/// dispatcher while another serves the unit of work.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
    fail_outbox_append: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next change set after its aggregate writes and before its
    /// outbox append. The aggregate writes are undone.
    pub fn fail_next_outbox_append(&self) {
        self.fail_outbox_append.store(true, Ordering::SeqCst);
    }

    pub fn aggregate_count(&self) -> Result<usize, StoreError> {
        Ok(self.read("aggregate read")?.aggregates.len())
    }

    fn read(&self, operation: &'static str) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::LockPoisoned(operation))
    }

    fn write(&self, operation: &'static str) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::LockPoisoned(operation))
    }
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    async fn apply(&self, changes: ChangeSet) -> Result<(), StoreError> {
        let mut tables = self.write("apply")?;
        let mut undo = Vec::with_capacity(changes.aggregates.len());

        for write in changes.aggregates {
            let key = (write.kind.clone(), write.id.clone());
            let actual = tables
                .aggregates
                .get(&key)
                .map(|stored| stored.version)
                .unwrap_or(0);
            if actual != write.expected_version {
                tables.undo(undo);
                return Err(StoreError::ConcurrentWrite {
                    kind: write.kind,
                    id: write.id,
                    expected: write.expected_version,
                    actual,
                });
            }

            let previous = tables.aggregates.insert(
                key.clone(),
                StoredAggregate {
                    kind: write.kind,
                    id: write.id,
                    version: write.version,
                    state: write.state,
                },
            );
            undo.push((key, previous));
        }

        if self.fail_outbox_append.swap(false, Ordering::SeqCst) {
            tables.undo(undo);
            return Err(StoreError::InjectedFailure("outbox append"));
        }

        tables.outbox.extend(changes.outbox);
        Ok(())
    }

    async fn load_aggregate(&self, kind: &str, id: &str) -> Result<Option<StoredAggregate>, StoreError> {
        let tables = self.read("aggregate read")?;
        Ok(tables
            .aggregates
            .get(&(kind.to_string(), id.to_string()))
            .cloned())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Option<Duration>,
    ) -> Result<Option<OutboxEntry>, StoreError> {
        let mut tables = self.write("outbox claim")?;
        let next = tables
            .outbox
            .iter_mut()
            .filter(|entry| entry.is_claimable(now))
            .min_by_key(|entry| entry.added_at);

        Ok(next.map(|entry| {
            entry.claim(now, lease);
            entry.clone()
        }))
    }

    async fn release(&self, claim: &OutboxEntry, retry_at: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let mut tables = self.write("outbox release")?;
        tables.held_entry_mut(claim)?.release(retry_at);
        Ok(())
    }

    async fn remove(&self, claim: &OutboxEntry) -> Result<(), StoreError> {
        let mut tables = self.write("outbox remove")?;
        tables.held_entry_mut(claim)?;
        tables.outbox.retain(|entry| entry.id != claim.id);
        Ok(())
    }

    async fn list_by_action(&self, action_id: Uuid) -> Result<Vec<OutboxEntry>, StoreError> {
        let tables = self.read("outbox read")?;
        Ok(tables
            .outbox
            .iter()
            .filter(|entry| entry.action_id == action_id)
            .cloned()
            .collect())
    }

    async fn entries(&self) -> Result<Vec<OutboxEntry>, StoreError> {
        let tables = self.read("outbox read")?;
        let mut entries = tables.outbox.clone();
        // stable: insertion order breaks ties
        entries.sort_by_key(|entry| entry.added_at);
        Ok(entries)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryStore {
    async fn enqueue(&self, entry: DeadLetterEntry) -> Result<(), StoreError> {
        self.write("dead letter write")?.dead_letters.push(entry);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        Ok(self.read("dead letter read")?.dead_letters.clone())
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let mut tables = self.write("dead letter write")?;
        let removed = tables.dead_letters.len();
        tables.dead_letters.clear();
        Ok(removed)
    }
}
