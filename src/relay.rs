//! One process's wiring of store, transport, dispatcher and listeners.
//!
//! ```ignore
//! let relay = Relay::builder(store)
//!     .with_config(RelayConfig::load("relay.toml")?)
//!     .with_connectors(Connectors::new().with_amqp(connector))
//!     .listen::<OrderPlaced, _>("billing", charge_customer)?
//!     .build()?;
//! relay.start().await?;
//! // ...
//! let stats = relay.shutdown().await?;
//! ```

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;

use crate::clock::{self, Clock};
use crate::config::{ConfigError, RelayConfig};
use crate::event::Event;
use crate::listener::{Action, ListenerConfig, ListenerRegistry, RegistryError};
use crate::outbox::{DispatcherHandle, DispatcherStats, OutboxDispatcher};
use crate::store::TransactionalStore;
use crate::transport::{self, Connectors, MessagingTransport, TransportError};
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay is already running")]
    AlreadyStarted,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub struct RelayBuilder<S: ?Sized> {
    store: Arc<S>,
    config: RelayConfig,
    clock: Arc<dyn Clock>,
    connectors: Connectors,
    transport: Option<Arc<dyn MessagingTransport>>,
    registry: ListenerRegistry<S>,
}

impl<S: TransactionalStore + ?Sized> RelayBuilder<S> {
    /// Replaces the whole configuration. Call before registering listeners:
    /// `listen` picks up `config.listener` as it is at that point.
    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.registry = self.registry.with_defaults(config.listener);
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.registry = self.registry.with_clock(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Broker clients used to build the configured backend.
    pub fn with_connectors(mut self, connectors: Connectors) -> Self {
        self.connectors = connectors;
        self
    }

    /// Use an already built transport instead of `config.transport`.
    pub fn with_transport(mut self, transport: Arc<dyn MessagingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn listen<E, A>(mut self, group: &str, action: A) -> Result<Self, RelayError>
    where
        E: Event,
        A: Action<E>,
    {
        self.registry = self.registry.listen::<E, A>(group, action)?;
        Ok(self)
    }

    pub fn listen_with<E, A>(mut self, group: &str, action: A, config: ListenerConfig) -> Result<Self, RelayError>
    where
        E: Event,
        A: Action<E>,
    {
        self.registry = self.registry.listen_with::<E, A>(group, action, config)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Relay<S>, RelayError> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => transport::build(&self.config.transport, &self.connectors)?,
        };
        Ok(Relay {
            store: self.store,
            transport,
            registry: self.registry,
            config: self.config,
            clock: self.clock,
            dispatcher: Mutex::new(None),
        })
    }
}

/// A running (or ready to run) outbox relay.
pub struct Relay<S: ?Sized> {
    store: Arc<S>,
    transport: Arc<dyn MessagingTransport>,
    registry: ListenerRegistry<S>,
    config: RelayConfig,
    clock: Arc<dyn Clock>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
}

impl<S: TransactionalStore + ?Sized> Relay<S> {
    pub fn builder(store: Arc<S>) -> RelayBuilder<S> {
        RelayBuilder {
            registry: ListenerRegistry::new(Arc::clone(&store)),
            store,
            config: RelayConfig::default(),
            clock: clock::system(),
            connectors: Connectors::default(),
            transport: None,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn MessagingTransport> {
        &self.transport
    }

    pub fn registry(&self) -> &ListenerRegistry<S> {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// A unit of work on the relay's store, clock and payload format.
    pub fn unit_of_work(&self) -> UnitOfWork<S> {
        UnitOfWork::new(Arc::clone(&self.store))
            .with_clock(Arc::clone(&self.clock))
            .with_format(self.config.listener.format)
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Start listeners first so their groups exist before anything is
    /// published, then the dispatcher.
    pub async fn start(&self) -> Result<(), RelayError> {
        if self.is_running() {
            return Err(RelayError::AlreadyStarted);
        }
        self.registry.start_all(self.transport.as_ref()).await?;

        let dispatcher = OutboxDispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            self.config.dispatcher.clone(),
        )
        .with_clock(Arc::clone(&self.clock));
        let handle = dispatcher.spawn();

        let mut slot = self
            .dispatcher
            .lock()
            .map_err(|_| TransportError::Poisoned("relay dispatcher"))?;
        *slot = Some(handle);
        info!(
            backend = %self.transport.backend(),
            listeners = self.registry.len(),
            "relay started"
        );
        Ok(())
    }

    /// Stop the dispatcher, then the listeners, then dispose the transport.
    pub async fn shutdown(&self) -> Result<DispatcherStats, RelayError> {
        let handle = self
            .dispatcher
            .lock()
            .map_err(|_| TransportError::Poisoned("relay dispatcher"))?
            .take();
        let stats = match handle {
            Some(handle) => handle.stop().await,
            None => DispatcherStats::default(),
        };
        self.registry.stop_all().await?;
        self.transport.dispose().await?;
        info!(
            published = stats.messages_published,
            failed = stats.messages_failed,
            "relay stopped"
        );
        Ok(stats)
    }
}
