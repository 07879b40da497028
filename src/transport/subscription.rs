use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::TransportError;

/// Identity of a subscription within one transport instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub topic: String,
    pub group: String,
}

impl SubscriptionKey {
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.group)
    }
}

/// Live subscriptions of one transport, keyed by (topic, group).
///
/// A key is reserved before the broker resources are provisioned so two
/// concurrent subscribes for the same pair cannot both succeed.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    live: Mutex<HashMap<SubscriptionKey, Option<Arc<SubscriptionInner>>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reserve(&self, key: &SubscriptionKey) -> Result<(), TransportError> {
        let mut live = self
            .live
            .lock()
            .map_err(|_| TransportError::Poisoned("subscription registry"))?;
        if live.contains_key(key) {
            return Err(TransportError::AlreadySubscribed {
                topic: key.topic.clone(),
                group: key.group.clone(),
            });
        }
        live.insert(key.clone(), None);
        Ok(())
    }

    /// Drop a reservation whose provisioning failed.
    pub fn abandon(&self, key: &SubscriptionKey) {
        self.remove(key);
    }

    /// Turn a reservation into a live subscription driven by `task`.
    pub fn activate(
        self: &Arc<Self>,
        key: SubscriptionKey,
        token: CancellationToken,
        task: JoinHandle<()>,
    ) -> Subscription {
        let inner = Arc::new(SubscriptionInner {
            key: key.clone(),
            token,
            task: tokio::sync::Mutex::new(Some(task)),
            disposed: AtomicBool::new(false),
            registry: Arc::downgrade(self),
        });
        if let Ok(mut live) = self.live.lock() {
            live.insert(key, Some(Arc::clone(&inner)));
        }
        Subscription { inner }
    }

    /// Take every live subscription, leaving the registry empty.
    pub fn drain(&self) -> Vec<Arc<SubscriptionInner>> {
        match self.live.lock() {
            Ok(mut live) => live.drain().filter_map(|(_, inner)| inner).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    fn remove(&self, key: &SubscriptionKey) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(key);
        }
    }
}

pub(crate) struct SubscriptionInner {
    key: SubscriptionKey,
    token: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    registry: Weak<SubscriptionRegistry>,
}

impl SubscriptionInner {
    /// Cancel the consumer and wait for it to release its broker resources.
    /// Only the first call does anything.
    pub async fn dispose(&self) -> Result<(), TransportError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.token.cancel();

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!(subscription = %self.key, "consumer task panicked");
                }
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key);
        }
        debug!(subscription = %self.key, "subscription disposed");
        Ok(())
    }
}

/// A live consumer on (topic, group).
///
/// Dropping an undisposed subscription cancels its consumer; call
/// [`dispose`](Subscription::dispose) to also wait for the broker-side
/// consumer to be released.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.inner.key.topic)
            .field("group", &self.inner.key.group)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.inner.key
    }

    pub fn topic(&self) -> &str {
        &self.inner.key.topic
    }

    pub fn group(&self) -> &str {
        &self.inner.key.group
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub async fn dispose(&self) -> Result<(), TransportError> {
        self.inner.dispose().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.is_disposed() {
            return;
        }
        self.inner.token.cancel();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move {
                let _ = inner.dispose().await;
            });
        }
    }
}
