//! Transactional outbox and event delivery.
//!
//! A [`UnitOfWork`] writes aggregate state and the events it produced in one
//! transaction. An [`OutboxDispatcher`] publishes staged events through a
//! [`MessagingTransport`], and an [`EventListener`] on the consuming side
//! runs a business [`Action`] per event, re-staging failures through the
//! outbox and dead-lettering them once the retry budget is spent.

pub mod aggregate;
pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod event;
pub mod listener;
pub mod logging;
pub mod outbox;
pub mod relay;
pub mod store;
pub mod transport;
pub mod unit_of_work;

pub use aggregate::{Aggregate, AggregateRoot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, RelayConfig};
pub use dead_letter::{DeadLetterEntry, DeadLetterStore};
pub use event::{Event, EventEnvelope, EventHeader, EventKind, PayloadFormat, SerializationError};
pub use listener::{
    Action, ActionError, Disposition, EventListener, ListenerConfig, ListenerRegistry, ListenerStats, RegistryError,
};
pub use logging::LoggingConfig;
pub use outbox::{CycleOutcome, DispatcherConfig, DispatcherHandle, DispatcherStats, OutboxDispatcher, OutboxEntry, OutboxStore};
pub use relay::{Relay, RelayBuilder, RelayError};
pub use store::{InMemoryStore, StoreError, TransactionalStore};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use transport::{
    Backend, HandlerError, Message, MessageHandler, MessagingTransport, Subscription, TransportConfig, TransportError,
};
pub use unit_of_work::{CommitReceipt, UnitOfWork, UnitOfWorkError};
