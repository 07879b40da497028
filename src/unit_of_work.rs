//! Commits aggregate state and the events it produced in one transaction.
//!
//! ```text
//! begin ──► load / save(aggregate) / add_event ──► commit ──► store.apply(ChangeSet)
//!                                                     │
//!                                                     └─ error ─► rollback, Err
//! ```

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::clock::{self, Clock};
use crate::event::{Event, EventEnvelope, EventHeader, PayloadFormat, SerializationError};
use crate::outbox::OutboxEntry;
use crate::store::{AggregateWrite, ChangeSet, StoreError, TransactionalStore};

#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    #[error("no transaction in progress; call begin first")]
    NotStarted,
    #[error("a transaction is already in progress")]
    AlreadyStarted,
    #[error("aggregate of kind {0} has no id")]
    MissingId(&'static str),
    #[error("event payload could not be encoded: {0}")]
    Serialization(#[from] SerializationError),
    #[error("aggregate state could not be (de)serialized: {0}")]
    State(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a successful commit wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub action_id: Uuid,
    pub aggregates: usize,
    /// Event ids staged in the outbox.
    pub events: Vec<Uuid>,
}

/// Collects aggregate writes and outbox entries, then applies them
/// atomically.
pub struct UnitOfWork<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    format: PayloadFormat,
    changes: Option<ChangeSet>,
}

impl<S: TransactionalStore + ?Sized> UnitOfWork<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock: clock::system(),
            format: PayloadFormat::default(),
            changes: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }

    /// Start a transaction and return its action id.
    pub fn begin(&mut self) -> Result<Uuid, UnitOfWorkError> {
        if self.changes.is_some() {
            return Err(UnitOfWorkError::AlreadyStarted);
        }
        let action_id = Uuid::new_v4();
        self.changes = Some(ChangeSet::new(action_id));
        Ok(action_id)
    }

    pub fn is_active(&self) -> bool {
        self.changes.is_some()
    }

    pub fn action_id(&self) -> Option<Uuid> {
        self.changes.as_ref().map(|changes| changes.action_id)
    }

    /// Read committed state. The returned aggregate remembers the version it
    /// was loaded at, which `save` checks on commit.
    pub async fn load<A: Aggregate>(&self, id: &str) -> Result<Option<A>, UnitOfWorkError> {
        let Some(stored) = self.store.load_aggregate(A::KIND, id).await? else {
            return Ok(None);
        };
        let mut aggregate: A = serde_json::from_slice(&stored.state)?;
        aggregate.root_mut().set_id(stored.id);
        aggregate.root_mut().set_version(stored.version);
        Ok(Some(aggregate))
    }

    /// Stage the aggregate's state and drain the events it raised into the
    /// outbox of this transaction.
    pub fn save<A: Aggregate>(&mut self, aggregate: &mut A) -> Result<(), UnitOfWorkError> {
        let action_id = self.action_id().ok_or(UnitOfWorkError::NotStarted)?;
        if aggregate.id().is_empty() {
            return Err(UnitOfWorkError::MissingId(A::KIND));
        }

        let expected_version = aggregate.version();
        let write = AggregateWrite {
            kind: A::KIND.to_string(),
            id: aggregate.id().to_string(),
            expected_version,
            version: expected_version + 1,
            state: serde_json::to_vec(aggregate)?,
        };

        let now = self.clock.now();
        let raised = aggregate.root_mut().take_raised();
        let mut entries = Vec::with_capacity(raised.len());
        for event in &raised {
            let header = EventHeader::new(action_id, event.kind(), now);
            let payload = event.encode(&header, self.format)?;
            entries.push(OutboxEntry::new(&header, event.name(), event.schema_version(), payload, now));
        }

        let changes = self.changes.as_mut().ok_or(UnitOfWorkError::NotStarted)?;
        changes.aggregates.push(write);
        changes.outbox.extend(entries);
        aggregate.root_mut().set_version(expected_version + 1);
        Ok(())
    }

    /// Stage an event that is not tied to an aggregate. Returns its event id.
    pub fn add_event<E: Event>(&mut self, event: &E) -> Result<Uuid, UnitOfWorkError> {
        let action_id = self.action_id().ok_or(UnitOfWorkError::NotStarted)?;
        let header = EventHeader::new(action_id, E::KIND, self.clock.now());
        self.stage(header, event)
    }

    /// Stage an already-delivered event again under its existing header.
    pub(crate) fn restage<E: Event>(&mut self, header: EventHeader, event: &E) -> Result<Uuid, UnitOfWorkError> {
        self.stage(header, event)
    }

    fn stage<E: Event>(&mut self, header: EventHeader, event: &E) -> Result<Uuid, UnitOfWorkError> {
        let payload = self.format.encode(&EventEnvelope::new(header.clone(), event))?;
        let entry = OutboxEntry::new(&header, E::NAME, E::VERSION, payload, self.clock.now());
        let changes = self.changes.as_mut().ok_or(UnitOfWorkError::NotStarted)?;
        changes.outbox.push(entry);
        Ok(header.event_id)
    }

    /// Apply everything staged since `begin`. On failure the transaction is
    /// rolled back before the error is returned.
    pub async fn commit(&mut self) -> Result<CommitReceipt, UnitOfWorkError> {
        let changes = self.changes.take().ok_or(UnitOfWorkError::NotStarted)?;
        let receipt = CommitReceipt {
            action_id: changes.action_id,
            aggregates: changes.aggregates.len(),
            events: changes.outbox.iter().map(|entry| entry.event_id).collect(),
        };

        match self.store.apply(changes).await {
            Ok(()) => {
                debug!(
                    action_id = %receipt.action_id,
                    aggregates = receipt.aggregates,
                    events = receipt.events.len(),
                    "unit of work committed"
                );
                Ok(receipt)
            }
            Err(err) => {
                warn!(action_id = %receipt.action_id, error = %err, "commit failed, rolled back");
                Err(err.into())
            }
        }
    }

    /// Discard everything staged since `begin`. Returns whether a
    /// transaction was active.
    pub fn rollback(&mut self) -> bool {
        self.changes.take().is_some()
    }
}
