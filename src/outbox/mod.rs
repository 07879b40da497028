//! Outbox entries, claim-based access to them and the dispatcher that
//! publishes them.
//!
//! ```text
//!        ┌──────────── claim_next ────────────┐
//!        │                                    ▼
//!   OutboxStore ◄── remove (published) ── OutboxDispatcher ── publish ──► MessagingTransport
//!        ▲                                    │
//!        └──────── release (failed) ──────────┘
//! ```

mod dispatcher;
mod entry;
mod store;

pub use dispatcher::{CycleOutcome, DispatcherConfig, DispatcherHandle, DispatcherStats, OutboxDispatcher};
pub(crate) use entry::lease_deadline;
pub use entry::OutboxEntry;
pub use store::OutboxStore;
