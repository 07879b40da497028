use serde::{Deserialize, Serialize};

use super::EventHeader;

/// Header plus body, the unit a [`PayloadFormat`](super::PayloadFormat)
/// encodes into an outbox payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    pub header: EventHeader,
    pub body: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(header: EventHeader, body: E) -> Self {
        Self { header, body }
    }
}
