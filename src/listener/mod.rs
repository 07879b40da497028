//! Consumer side of event delivery.
//!
//! An [`EventListener`] subscribes one consumer group to the topic of one
//! event type and runs a business [`Action`] for every message:
//!
//! ```text
//! Message ─► decode ─┬─ error ─────────────────────────────► dead letter ─► ack
//!                    └─► Action ─┬─ Ok ────────────────────────────────────► ack
//!                                └─ Err ─┬─ retries left ─► re-stage in outbox ─► ack
//!                                        └─ exhausted ────► dead letter ─────► ack
//! ```
//!
//! Re-staged events go back through the outbox with the same event id and
//! an incremented `delivery_retries`, so a retry survives a crash of the
//! consumer. Only when re-staging or dead-lettering itself fails is the
//! message left unacknowledged for the broker to redeliver.

mod action;
mod event_listener;
mod registry;

pub use action::{Action, ActionError};
pub use event_listener::{Disposition, EventListener, ListenerConfig, ListenerStats};
pub use registry::{ListenerRegistry, ManagedListener, RegistryError};
