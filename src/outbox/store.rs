use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::OutboxEntry;
use crate::store::StoreError;

/// Claim-based access to staged outbox entries.
///
/// Entries are appended only through
/// [`TransactionalStore::apply`](crate::store::TransactionalStore::apply),
/// inside the caller's transaction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically take the oldest claimable entry and mark it claimed.
    ///
    /// With `lease` set, the claim expires and the entry becomes claimable
    /// again once `now` passes the deadline.
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Option<Duration>,
    ) -> Result<Option<OutboxEntry>, StoreError>;

    /// Return a claimed entry to the pending pool after a failed publish.
    ///
    /// `claim` is the entry as returned by [`claim_next`](Self::claim_next);
    /// a claim that has since been taken over by another caller is rejected.
    /// With `retry_at` set, the entry is skipped by `claim_next` until then.
    async fn release(&self, claim: &OutboxEntry, retry_at: Option<DateTime<Utc>>) -> Result<(), StoreError>;

    /// Delete a claimed entry after a confirmed publish. Same claim rules as
    /// [`release`](Self::release).
    async fn remove(&self, claim: &OutboxEntry) -> Result<(), StoreError>;

    /// Entries staged by one transaction.
    async fn list_by_action(&self, action_id: Uuid) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Every staged entry, in dispatch order.
    async fn entries(&self) -> Result<Vec<OutboxEntry>, StoreError>;
}
