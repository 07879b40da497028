//! Outbox delivery tests: atomic staging, claim exclusivity, the listener's
//! retry and dead-letter policy, and the full path from an aggregate to a
//! consumer on every backend.

mod atomicity;
mod claims;
mod end_to_end;
mod retry;
mod support;
