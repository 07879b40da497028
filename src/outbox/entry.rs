use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{topic_name, EventHeader};

/// One staged event awaiting publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub event_id: Uuid,
    /// Transaction that staged the entry.
    pub action_id: Uuid,
    pub event_name: String,
    pub schema_version: u32,
    pub is_domain_event: bool,
    /// Encoded [`EventEnvelope`](crate::EventEnvelope).
    pub payload: Vec<u8>,
    pub added_at: DateTime<Utc>,
    pub is_publishing: bool,
    pub num_delivery_failures: u32,
    /// End of the current claim lease. `None` while unclaimed, or when the
    /// claim was taken without a lease.
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,
    /// Token of the current claim. Only its holder may release or remove
    /// the entry.
    #[serde(default)]
    pub claim_id: Option<Uuid>,
    /// A released entry is not claimable again before this instant.
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// A fresh, unclaimed entry. The entry id is new even when the header
    /// belongs to an event that was staged before.
    pub fn new(
        header: &EventHeader,
        event_name: impl Into<String>,
        schema_version: u32,
        payload: Vec<u8>,
        added_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: header.event_id,
            action_id: header.action_id,
            event_name: event_name.into(),
            schema_version,
            is_domain_event: header.kind.is_domain(),
            payload,
            added_at,
            is_publishing: false,
            num_delivery_failures: 0,
            claimed_until: None,
            claim_id: None,
            retry_at: None,
        }
    }

    pub fn topic(&self) -> String {
        topic_name(&self.event_name, self.schema_version)
    }

    /// Unclaimed and due, or claimed under a lease that has run out.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        if self.is_publishing {
            self.claimed_until.is_some_and(|until| until <= now)
        } else {
            self.retry_at.map_or(true, |at| at <= now)
        }
    }

    /// Whether `claim` is the claim this entry is currently held under.
    pub fn is_held_by(&self, claim: &OutboxEntry) -> bool {
        self.is_publishing && self.claim_id.is_some() && self.claim_id == claim.claim_id
    }

    pub(crate) fn claim(&mut self, now: DateTime<Utc>, lease: Option<Duration>) {
        self.is_publishing = true;
        self.claimed_until = lease_deadline(now, lease);
        self.claim_id = Some(Uuid::new_v4());
        self.retry_at = None;
    }

    pub(crate) fn release(&mut self, retry_at: Option<DateTime<Utc>>) {
        self.is_publishing = false;
        self.claimed_until = None;
        self.claim_id = None;
        self.retry_at = retry_at;
        self.num_delivery_failures = self.num_delivery_failures.saturating_add(1);
    }
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Option<Duration>) -> Option<DateTime<Utc>> {
    let lease = chrono::Duration::from_std(lease?).unwrap_or(chrono::Duration::MAX);
    Some(now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC))
}
