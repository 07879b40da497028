//! Terminal sink for events a listener gave up on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    /// Nil when the payload could not be decoded far enough to read it.
    pub event_id: Uuid,
    pub payload: Vec<u8>,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        event_id: Uuid,
        payload: Vec<u8>,
        reason: impl Into<String>,
        dead_lettered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id,
            payload,
            reason: reason.into(),
            dead_lettered_at,
        }
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Append-only.
    async fn enqueue(&self, entry: DeadLetterEntry) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Remove every entry; returns how many were removed.
    async fn clear(&self) -> Result<usize, StoreError>;
}
