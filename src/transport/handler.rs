use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::Message;

/// Negative acknowledgement reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct HandlerError {
    reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        Self::new(reason)
    }
}

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

/// Callback a subscription invokes for each delivered message.
///
/// `Ok` acknowledges the message; `Err` asks the broker to redeliver it.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Ack,
    Nack(String),
    /// The subscription is shutting down; leave the message unacknowledged.
    Cancelled,
}

/// Run a handler under the acknowledgement timeout.
pub(crate) async fn invoke(
    handler: &dyn MessageHandler,
    message: Message,
    ack_timeout: Duration,
    token: &CancellationToken,
) -> Outcome {
    tokio::select! {
        _ = token.cancelled() => Outcome::Cancelled,
        result = tokio::time::timeout(ack_timeout, handler.handle(message)) => match result {
            Ok(Ok(())) => Outcome::Ack,
            Ok(Err(err)) => Outcome::Nack(err.to_string()),
            Err(_) => Outcome::Nack(format!("not acknowledged within {ack_timeout:?}")),
        },
    }
}

/// Sleep out the redelivery delay. Returns false if cancelled first.
pub(crate) async fn redelivery_pause(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler = |message: Message| async move {
            if message.payload.is_empty() {
                Err(HandlerError::new("empty"))
            } else {
                Ok(())
            }
        };
        let token = CancellationToken::new();

        let ok = invoke(&handler, Message::new("1", vec![1]), Duration::from_secs(1), &token).await;
        let nack = invoke(&handler, Message::new("2", vec![]), Duration::from_secs(1), &token).await;

        assert_eq!(ok, Outcome::Ack);
        assert_eq!(nack, Outcome::Nack("empty".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_is_nacked_after_ack_timeout() {
        let handler = |_message: Message| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), HandlerError>(())
        };
        let token = CancellationToken::new();

        let outcome = invoke(&handler, Message::new("1", vec![]), Duration::from_secs(1), &token).await;

        assert!(matches!(outcome, Outcome::Nack(reason) if reason.contains("not acknowledged")));
    }

    #[tokio::test]
    async fn cancellation_leaves_message_unacked() {
        let handler = |_message: Message| std::future::pending::<Result<(), HandlerError>>();
        let token = CancellationToken::new();
        token.cancel();

        let outcome = invoke(&handler, Message::new("1", vec![]), Duration::from_secs(1), &token).await;
        assert_eq!(outcome, Outcome::Cancelled);
    }
}
