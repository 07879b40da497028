//! Events, the header that travels with them and the envelope that is
//! written to the outbox.
//!
//! ```text
//!   Aggregate::raise(E) ──┐
//!                         ├─► EventEnvelope { header, body } ─► PayloadFormat ─► OutboxEntry.payload
//!   UnitOfWork::add_event ┘
//! ```
//!
//! The topic an event is published on is derived from its name and schema
//! version, e.g. `Account-Opened-v1`.

mod envelope;
mod format;
mod header;

pub use envelope::EventEnvelope;
pub use format::{PayloadFormat, SerializationError};
pub use header::{EventHeader, EventKind};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A message that can be staged in the outbox and consumed by a listener.
pub trait Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable event name. Domain events are conventionally named
    /// `{Aggregate}-{Event}`.
    const NAME: &'static str;

    /// Schema version; part of the topic name.
    const VERSION: u32 = 1;

    const KIND: EventKind = EventKind::Integration;

    fn topic() -> String {
        topic_name(Self::NAME, Self::VERSION)
    }
}

/// Topic for an event name and schema version.
pub fn topic_name(event_name: &str, schema_version: u32) -> String {
    format!("{event_name}-v{schema_version}")
}
