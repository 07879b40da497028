use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{lease_deadline, OutboxEntry, OutboxStore};
use crate::clock::{self, Clock};
use crate::store::StoreError;
use crate::transport::{Message, MessagingTransport, TransportError};

mod defaults {
    pub fn poll_interval_ms() -> u64 {
        100
    }

    pub fn claim_lease_secs() -> u64 {
        300
    }

    pub fn retry_delay_ms() -> u64 {
        1_000
    }

    pub fn max_retry_delay_ms() -> u64 {
        60_000
    }

    pub fn dispatcher_id() -> String {
        format!("dispatcher-{}", std::process::id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Sleep between polls when the outbox is empty.
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a claim protects an entry; 0 means claims never expire.
    #[serde(default = "defaults::claim_lease_secs")]
    pub claim_lease_secs: u64,
    /// Hold-off before a failed entry may be claimed again. Doubles with
    /// every further failure of the same entry.
    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "defaults::max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "defaults::dispatcher_id")]
    pub dispatcher_id: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::poll_interval_ms(),
            claim_lease_secs: defaults::claim_lease_secs(),
            retry_delay_ms: defaults::retry_delay_ms(),
            max_retry_delay_ms: defaults::max_retry_delay_ms(),
            dispatcher_id: defaults::dispatcher_id(),
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_lease(&self) -> Option<Duration> {
        (self.claim_lease_secs > 0).then(|| Duration::from_secs(self.claim_lease_secs))
    }

    /// Hold-off after an entry's `failures`-th failed publish (counting from 0).
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let factor = 1u64.checked_shl(failures.min(32)).unwrap_or(u64::MAX);
        let delay = self.retry_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_retry_delay_ms.max(self.retry_delay_ms)))
    }

    pub fn with_retry_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_delay_ms = initial.as_millis() as u64;
        self.max_retry_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_claim_lease(mut self, lease: Option<Duration>) -> Self {
        self.claim_lease_secs = lease.map(|lease| lease.as_secs()).unwrap_or(0);
        self
    }

    pub fn with_dispatcher_id(mut self, id: impl Into<String>) -> Self {
        self.dispatcher_id = id.into();
        self
    }
}

/// Result of one dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was claimable.
    Idle,
    /// The entry was published and removed.
    Published(Uuid),
    /// Publishing failed; the entry was released and is held off until its
    /// retry time.
    Failed(Uuid),
}

/// Statistics from a dispatcher loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    pub messages_published: usize,
    pub messages_failed: usize,
    pub polls: usize,
}

/// Moves outbox entries to the transport, one at a time.
///
/// Several dispatchers may poll the same store; the store's atomic claim
/// keeps them from publishing the same entry concurrently.
pub struct OutboxDispatcher<S: ?Sized> {
    store: Arc<S>,
    transport: Arc<dyn MessagingTransport>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl<S: OutboxStore + ?Sized + 'static> OutboxDispatcher<S> {
    pub fn new(store: Arc<S>, transport: Arc<dyn MessagingTransport>, config: DispatcherConfig) -> Self {
        Self {
            store,
            transport,
            clock: clock::system(),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claim the oldest entry, publish it, then remove or release it.
    pub async fn run_once(&self) -> Result<CycleOutcome, StoreError> {
        let Some(entry) = self.claim().await? else {
            return Ok(CycleOutcome::Idle);
        };
        let result = self.publish(&entry).await;
        self.settle(&entry, result).await
    }

    /// Run the polling loop on a background task.
    pub fn spawn(self) -> DispatcherHandle {
        let token = CancellationToken::new();
        let handle = tokio::spawn(self.run(token.clone()));
        DispatcherHandle {
            token,
            handle: Some(handle),
        }
    }

    async fn run(self, token: CancellationToken) -> DispatcherStats {
        let mut stats = DispatcherStats::default();
        info!(dispatcher = %self.config.dispatcher_id, "outbox dispatcher started");

        while !token.is_cancelled() {
            stats.polls += 1;
            let entry = match self.claim().await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.idle(&token).await;
                    continue;
                }
                Err(err) => {
                    warn!(dispatcher = %self.config.dispatcher_id, error = %err, "outbox claim failed");
                    self.idle(&token).await;
                    continue;
                }
            };

            let result = tokio::select! {
                _ = token.cancelled() => {
                    if let Err(err) = self.store.release(&entry, None).await {
                        warn!(entry_id = %entry.id, error = %err, "failed to release claim on shutdown");
                    }
                    break;
                }
                result = self.publish(&entry) => result,
            };

            match self.settle(&entry, result).await {
                Ok(CycleOutcome::Published(_)) => stats.messages_published += 1,
                Ok(CycleOutcome::Idle) => {}
                Ok(CycleOutcome::Failed(_)) => {
                    stats.messages_failed += 1;
                    self.idle(&token).await;
                }
                Err(err) => {
                    stats.messages_failed += 1;
                    warn!(entry_id = %entry.id, error = %err, "failed to settle outbox entry");
                    self.idle(&token).await;
                }
            }
        }

        info!(
            dispatcher = %self.config.dispatcher_id,
            published = stats.messages_published,
            failed = stats.messages_failed,
            "outbox dispatcher stopped"
        );
        stats
    }

    async fn idle(&self, token: &CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval()) => {}
        }
    }

    async fn claim(&self) -> Result<Option<OutboxEntry>, StoreError> {
        self.store
            .claim_next(self.clock.now(), self.config.claim_lease())
            .await
    }

    async fn publish(&self, entry: &OutboxEntry) -> Result<(), TransportError> {
        let topic = entry.topic();
        let message = Message::new(entry.event_id.to_string(), entry.payload.clone())
            .with_metadata("event-name", entry.event_name.clone())
            .with_metadata("schema-version", entry.schema_version.to_string())
            .with_metadata("action-id", entry.action_id.to_string())
            .with_metadata("outbox-entry-id", entry.id.to_string());
        self.transport.publish(&topic, message).await
    }

    async fn settle(
        &self,
        entry: &OutboxEntry,
        result: Result<(), TransportError>,
    ) -> Result<CycleOutcome, StoreError> {
        match result {
            Ok(()) => {
                self.store.remove(entry).await?;
                debug!(entry_id = %entry.id, event = %entry.event_name, "outbox entry published");
                Ok(CycleOutcome::Published(entry.id))
            }
            Err(err) => {
                let delay = self.config.retry_delay(entry.num_delivery_failures);
                warn!(
                    entry_id = %entry.id,
                    topic = %entry.topic(),
                    failures = entry.num_delivery_failures + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "publish failed, releasing outbox entry"
                );
                let retry_at = lease_deadline(self.clock.now(), Some(delay));
                self.store.release(entry, retry_at).await?;
                Ok(CycleOutcome::Failed(entry.id))
            }
        }
    }
}

/// Handle to a spawned dispatcher loop.
pub struct DispatcherHandle {
    token: CancellationToken,
    handle: Option<JoinHandle<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Stop the loop and wait for it to finish its current cycle.
    pub async fn stop(mut self) -> DispatcherStats {
        self.token.cancel();
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => DispatcherStats::default(),
        }
    }

    /// Ask the loop to stop without waiting.
    pub fn signal_stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
