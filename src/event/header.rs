use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether an event was raised by an aggregate or staged directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Domain,
    Integration,
}

impl EventKind {
    pub fn is_domain(self) -> bool {
        matches!(self, EventKind::Domain)
    }
}

/// Metadata serialized alongside every event body.
///
/// `delivery_retries` is the only field that changes after the event is
/// first staged: the listener bumps it each time it re-stages a failed
/// event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub event_id: Uuid,
    pub action_id: Uuid,
    pub kind: EventKind,
    #[serde(default)]
    pub delivery_retries: u32,
    pub occurred_at: DateTime<Utc>,
}

impl EventHeader {
    pub fn new(action_id: Uuid, kind: EventKind, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            action_id,
            kind,
            delivery_retries: 0,
            occurred_at,
        }
    }

    /// Header for the next delivery attempt of the same event.
    pub fn next_retry(&self) -> Self {
        Self {
            delivery_retries: self.delivery_retries.saturating_add(1),
            ..self.clone()
        }
    }
}
