use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("claim conflict on outbox entry {id}: {reason}")]
    ClaimConflict { id: Uuid, reason: &'static str },
    #[error("concurrent write to {kind} {id}: expected version {expected}, found {actual}")]
    ConcurrentWrite {
        kind: String,
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("stored state could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("injected failure during {0}")]
    InjectedFailure(&'static str),
    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl StoreError {
    pub(crate) fn missing(id: Uuid) -> Self {
        StoreError::ClaimConflict {
            id,
            reason: "entry does not exist",
        }
    }

    pub(crate) fn unclaimed(id: Uuid) -> Self {
        StoreError::ClaimConflict {
            id,
            reason: "entry is not claimed",
        }
    }

    pub(crate) fn superseded(id: Uuid) -> Self {
        StoreError::ClaimConflict {
            id,
            reason: "claim is held by someone else",
        }
    }
}
