use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{Event, EventHeader};
use crate::unit_of_work::UnitOfWorkError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a business action. Every variant is retried by the listener
/// until the retry budget runs out.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    UnitOfWork(#[from] UnitOfWorkError),
    #[error(transparent)]
    Other(#[from] BoxError),
}

impl ActionError {
    pub fn other(err: impl Into<BoxError>) -> Self {
        ActionError::Other(err.into())
    }
}

/// Business logic run for each delivered event.
#[async_trait]
pub trait Action<E: Event>: Send + Sync + 'static {
    async fn execute(&self, event: E, header: EventHeader) -> Result<(), ActionError>;
}

#[async_trait]
impl<E, F, Fut> Action<E> for F
where
    E: Event,
    F: Fn(E, EventHeader) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ActionError>> + Send,
{
    async fn execute(&self, event: E, header: EventHeader) -> Result<(), ActionError> {
        (self)(event, header).await
    }
}
