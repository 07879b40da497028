use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use super::action::Action;
use super::event_listener::{EventListener, ListenerConfig, ListenerStats};
use crate::clock::{self, Clock};
use crate::event::Event;
use crate::store::TransactionalStore;
use crate::transport::{MessagingTransport, TransportError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a listener for topic {topic} in group {group} is already registered")]
    Duplicate { topic: String, group: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Type-erased listener lifecycle, so listeners of different event types can
/// be started and stopped together.
#[async_trait]
pub trait ManagedListener: Send + Sync {
    fn topic(&self) -> String;
    fn group(&self) -> &str;
    async fn start(&self, transport: &dyn MessagingTransport) -> Result<(), TransportError>;
    async fn stop(&self) -> Result<bool, TransportError>;
    fn is_running(&self) -> bool;
    fn stats(&self) -> ListenerStats;
}

#[async_trait]
impl<E, A, S> ManagedListener for EventListener<E, A, S>
where
    E: Event,
    A: Action<E>,
    S: TransactionalStore + ?Sized,
{
    fn topic(&self) -> String {
        EventListener::topic(self)
    }

    fn group(&self) -> &str {
        EventListener::group(self)
    }

    async fn start(&self, transport: &dyn MessagingTransport) -> Result<(), TransportError> {
        EventListener::start(self, transport).await
    }

    async fn stop(&self) -> Result<bool, TransportError> {
        EventListener::stop(self).await
    }

    fn is_running(&self) -> bool {
        EventListener::is_running(self)
    }

    fn stats(&self) -> ListenerStats {
        EventListener::stats(self)
    }
}

/// Explicit set of listeners a service runs.
///
/// ```ignore
/// let registry = ListenerRegistry::new(store)
///     .listen::<OrderPlaced, _>("billing", charge_customer)?
///     .listen_with::<OrderPlaced, _>("shipping", reserve_stock, ListenerConfig::default().with_max_retries(10))?;
/// registry.start_all(transport.as_ref()).await?;
/// ```
pub struct ListenerRegistry<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    defaults: ListenerConfig,
    listeners: Vec<Arc<dyn ManagedListener>>,
}

impl<S: TransactionalStore + ?Sized> ListenerRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock: clock::system(),
            defaults: ListenerConfig::default(),
            listeners: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Config for listeners registered with [`listen`](Self::listen).
    pub fn with_defaults(mut self, defaults: ListenerConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn listen<E, A>(self, group: &str, action: A) -> Result<Self, RegistryError>
    where
        E: Event,
        A: Action<E>,
    {
        let config = self.defaults;
        self.listen_with::<E, A>(group, action, config)
    }

    pub fn listen_with<E, A>(mut self, group: &str, action: A, config: ListenerConfig) -> Result<Self, RegistryError>
    where
        E: Event,
        A: Action<E>,
    {
        let topic = E::topic();
        if self.position(&topic, group).is_some() {
            return Err(RegistryError::Duplicate {
                topic,
                group: group.to_string(),
            });
        }
        let listener = EventListener::<E, A, S>::new(group, action, Arc::clone(&self.store))
            .with_config(config)
            .with_clock(Arc::clone(&self.clock));
        self.listeners.push(Arc::new(listener));
        Ok(self)
    }

    pub fn listeners(&self) -> &[Arc<dyn ManagedListener>] {
        &self.listeners
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Start every listener. If one fails, those already started are
    /// stopped again before the error is returned.
    pub async fn start_all(&self, transport: &dyn MessagingTransport) -> Result<(), RegistryError> {
        for (index, listener) in self.listeners.iter().enumerate() {
            if let Err(err) = listener.start(transport).await {
                warn!(topic = %listener.topic(), group = %listener.group(), error = %err, "listener failed to start");
                for started in self.listeners[..index].iter().rev() {
                    if let Err(stop_err) = started.stop().await {
                        warn!(topic = %started.topic(), group = %started.group(), error = %stop_err, "rollback stop failed");
                    }
                }
                return Err(err.into());
            }
        }
        info!(listeners = self.listeners.len(), "listeners started");
        Ok(())
    }

    /// Stop every listener, returning the first error after trying all.
    pub async fn stop_all(&self) -> Result<(), RegistryError> {
        let mut first_error = None;
        for listener in &self.listeners {
            if let Err(err) = listener.stop().await {
                warn!(topic = %listener.topic(), group = %listener.group(), error = %err, "listener failed to stop");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub fn stats_for(&self, topic: &str, group: &str) -> Option<ListenerStats> {
        self.position(topic, group).map(|index| self.listeners[index].stats())
    }

    fn position(&self, topic: &str, group: &str) -> Option<usize> {
        self.listeners
            .iter()
            .position(|listener| listener.topic() == topic && listener.group() == group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventHeader;
    use crate::listener::ActionError;
    use crate::store::InMemoryStore;
    use crate::transport::{InProcessBroker, InProcessTransport, TransportConfig};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Placed;

    impl Event for Placed {
        const NAME: &'static str = "Order-Placed";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Cancelled;

    impl Event for Cancelled {
        const NAME: &'static str = "Order-Cancelled";
    }

    async fn noop<E>(_: E, _: EventHeader) -> Result<(), ActionError> {
        Ok(())
    }

    #[test]
    fn duplicate_topic_and_group_is_rejected() {
        let registry = ListenerRegistry::new(Arc::new(InMemoryStore::new()))
            .listen::<Placed, _>("billing", noop::<Placed>)
            .unwrap()
            .listen::<Placed, _>("shipping", noop::<Placed>)
            .unwrap();

        let err = registry.listen::<Placed, _>("billing", noop::<Placed>).err().unwrap();

        assert!(matches!(err, RegistryError::Duplicate { ref topic, ref group } if topic == "Order-Placed-v1" && group == "billing"));
    }

    #[tokio::test]
    async fn start_all_rolls_back_on_failure() {
        let transport = InProcessTransport::new(
            InProcessBroker::new(),
            TransportConfig::default().with_auto_create_topics(false),
        );
        let registry = ListenerRegistry::new(Arc::new(InMemoryStore::new()))
            .listen::<Placed, _>("billing", noop::<Placed>)
            .unwrap()
            .listen::<Cancelled, _>("billing", noop::<Cancelled>)
            .unwrap();
        transport.broker().create_topic("Order-Placed-v1").unwrap();

        let err = registry.start_all(&transport).await.unwrap_err();

        assert!(matches!(err, RegistryError::Transport(TransportError::TopicNotFound { .. })));
        assert!(registry.listeners().iter().all(|listener| !listener.is_running()));
    }

    #[tokio::test]
    async fn stats_are_tracked_per_listener() {
        let transport = InProcessTransport::new(InProcessBroker::new(), TransportConfig::default());
        let registry = ListenerRegistry::new(Arc::new(InMemoryStore::new()))
            .listen::<Placed, _>("billing", noop::<Placed>)
            .unwrap();

        registry.start_all(&transport).await.unwrap();
        assert_eq!(registry.stats_for("Order-Placed-v1", "billing"), Some(ListenerStats::default()));
        assert_eq!(registry.stats_for("Order-Placed-v1", "shipping"), None);

        registry.stop_all().await.unwrap();
        assert!(registry.listeners().iter().all(|listener| !listener.is_running()));
    }
}
