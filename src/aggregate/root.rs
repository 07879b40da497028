use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventEnvelope, EventHeader, EventKind, PayloadFormat, SerializationError};

/// A raised event with its concrete type erased until it is encoded.
pub(crate) trait StagedEvent: Send + Sync {
    fn name(&self) -> &'static str;
    fn schema_version(&self) -> u32;
    fn kind(&self) -> EventKind;
    fn encode(&self, header: &EventHeader, format: PayloadFormat) -> Result<Vec<u8>, SerializationError>;
}

struct Raised<E>(E);

impl<E: Event> StagedEvent for Raised<E> {
    fn name(&self) -> &'static str {
        E::NAME
    }

    fn schema_version(&self) -> u32 {
        E::VERSION
    }

    fn kind(&self) -> EventKind {
        E::KIND
    }

    fn encode(&self, header: &EventHeader, format: PayloadFormat) -> Result<Vec<u8>, SerializationError> {
        format.encode(&EventEnvelope::new(header.clone(), &self.0))
    }
}

/// Identity, version and pending events of an aggregate.
///
/// Only the id is part of the serialized state. The version is tracked by
/// the store and the pending events live until the aggregate is saved.
#[derive(Default, Serialize, Deserialize)]
pub struct AggregateRoot {
    id: String,
    #[serde(skip, default)]
    version: u64,
    #[serde(skip, default)]
    raised: Vec<Box<dyn StagedEvent>>,
}

impl fmt::Debug for AggregateRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raised: Vec<&str> = self.raised.iter().map(|event| event.name()).collect();
        f.debug_struct("AggregateRoot")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("raised", &raised)
            .finish()
    }
}

impl AggregateRoot {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    /// Version of the last committed state; 0 for a new aggregate.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Record an event to be staged in the outbox when the aggregate is saved.
    pub fn raise<E: Event>(&mut self, event: E) {
        self.raised.push(Box::new(Raised(event)));
    }

    pub fn pending_events(&self) -> usize {
        self.raised.len()
    }

    pub(crate) fn take_raised(&mut self) -> Vec<Box<dyn StagedEvent>> {
        std::mem::take(&mut self.raised)
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
