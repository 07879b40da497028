use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::action::Action;
use crate::clock::{self, Clock};
use crate::dead_letter::DeadLetterEntry;
use crate::event::{Event, EventEnvelope, EventHeader, PayloadFormat};
use crate::store::TransactionalStore;
use crate::transport::{HandlerError, Message, MessageHandler, MessagingTransport, Subscription, TransportError};
use crate::unit_of_work::{UnitOfWork, UnitOfWorkError};

mod defaults {
    pub fn max_retries() -> u32 {
        5
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Re-stagings allowed before an event is dead-lettered; 0 retries
    /// forever.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub format: PayloadFormat,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            format: PayloadFormat::default(),
        }
    }
}

impl ListenerConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }

    /// Whether an event that already went through `delivery_retries`
    /// retries may be retried again.
    pub fn allows_retry(&self, delivery_retries: u32) -> bool {
        self.max_retries == 0 || delivery_retries < self.max_retries
    }
}

/// What the listener did with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    /// Re-staged in the outbox; `retries` is the new retry count.
    Retried { retries: u32 },
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub handled: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Default)]
struct Counters {
    handled: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            handled: self.handled.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// The per-message state machine. Cloned into the transport as the
/// subscription's handler.
struct Processor<E, A, S: ?Sized> {
    group: String,
    action: Arc<A>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: ListenerConfig,
    counters: Arc<Counters>,
    _event: PhantomData<fn() -> E>,
}

impl<E, A, S: ?Sized> Clone for Processor<E, A, S> {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            action: Arc::clone(&self.action),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            config: self.config,
            counters: Arc::clone(&self.counters),
            _event: PhantomData,
        }
    }
}

impl<E, A, S> Processor<E, A, S>
where
    E: Event,
    A: Action<E>,
    S: TransactionalStore + ?Sized,
{
    async fn process(&self, message: Message) -> Result<Disposition, HandlerError> {
        let envelope: EventEnvelope<E> = match self.config.format.decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                let event_id = Uuid::parse_str(&message.id).unwrap_or(Uuid::nil());
                self.dead_letter(event_id, &message, format!("undecodable payload: {err}"))
                    .await?;
                return Ok(Disposition::DeadLettered);
            }
        };
        let EventEnvelope { header, body } = envelope;

        let err = match self.action.execute(body.clone(), header.clone()).await {
            Ok(()) => {
                self.counters.handled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event = E::NAME,
                    group = %self.group,
                    event_id = %header.event_id,
                    retries = header.delivery_retries,
                    "event handled"
                );
                return Ok(Disposition::Handled);
            }
            Err(err) => err,
        };

        if self.config.allows_retry(header.delivery_retries) {
            let retry = header.next_retry();
            let retries = retry.delivery_retries;
            self.restage(retry, &body)
                .await
                .map_err(|stage_err| HandlerError::new(format!("re-staging failed: {stage_err}")))?;
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                event = E::NAME,
                group = %self.group,
                event_id = %header.event_id,
                retries,
                error = %err,
                "action failed, event re-staged"
            );
            return Ok(Disposition::Retried { retries });
        }

        self.dead_letter(header.event_id, &message, err.to_string()).await?;
        Ok(Disposition::DeadLettered)
    }

    async fn restage(&self, header: EventHeader, event: &E) -> Result<(), UnitOfWorkError> {
        let mut unit_of_work = UnitOfWork::new(Arc::clone(&self.store))
            .with_clock(Arc::clone(&self.clock))
            .with_format(self.config.format);
        unit_of_work.begin()?;
        unit_of_work.restage(header, event)?;
        unit_of_work.commit().await?;
        Ok(())
    }

    async fn dead_letter(&self, event_id: Uuid, message: &Message, reason: String) -> Result<(), HandlerError> {
        let entry = DeadLetterEntry::new(event_id, message.payload.clone(), reason, self.clock.now());
        let reason = entry.reason.clone();
        self.store
            .enqueue(entry)
            .await
            .map_err(|err| HandlerError::new(format!("dead-lettering failed: {err}")))?;
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        error!(
            event = E::NAME,
            group = %self.group,
            event_id = %event_id,
            reason = %reason,
            "event dead-lettered"
        );
        Ok(())
    }
}

#[async_trait]
impl<E, A, S> MessageHandler for Processor<E, A, S>
where
    E: Event,
    A: Action<E>,
    S: TransactionalStore + ?Sized,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        self.process(message).await.map(|_| ())
    }
}

/// Subscribes one consumer group to the topic of `E` and runs `A` for every
/// event delivered.
pub struct EventListener<E, A, S: ?Sized> {
    processor: Processor<E, A, S>,
    subscription: Mutex<Option<Subscription>>,
}

impl<E, A, S> EventListener<E, A, S>
where
    E: Event,
    A: Action<E>,
    S: TransactionalStore + ?Sized,
{
    pub fn new(group: impl Into<String>, action: A, store: Arc<S>) -> Self {
        Self {
            processor: Processor {
                group: group.into(),
                action: Arc::new(action),
                store,
                clock: clock::system(),
                config: ListenerConfig::default(),
                counters: Arc::new(Counters::default()),
                _event: PhantomData,
            },
            subscription: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: ListenerConfig) -> Self {
        self.processor.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.processor.clock = clock;
        self
    }

    pub fn topic(&self) -> String {
        E::topic()
    }

    pub fn group(&self) -> &str {
        &self.processor.group
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.processor.config
    }

    /// Subscribe on `transport`. Fails if this listener is already running.
    pub async fn start(&self, transport: &dyn MessagingTransport) -> Result<(), TransportError> {
        let topic = self.topic();
        if self.is_running() {
            return Err(TransportError::AlreadySubscribed {
                topic,
                group: self.processor.group.clone(),
            });
        }
        let handler: Arc<dyn MessageHandler> = Arc::new(self.processor.clone());
        let subscription = transport.subscribe(&topic, &self.processor.group, handler).await?;

        let raced = {
            let mut slot = self
                .subscription
                .lock()
                .map_err(|_| TransportError::Poisoned("listener subscription"))?;
            if slot.is_some() {
                Some(subscription)
            } else {
                *slot = Some(subscription);
                None
            }
        };
        if let Some(subscription) = raced {
            // a concurrent start on another transport won
            subscription.dispose().await?;
            return Err(TransportError::AlreadySubscribed {
                topic,
                group: self.processor.group.clone(),
            });
        }
        info!(event = E::NAME, topic = %topic, group = %self.processor.group, "listener started");
        Ok(())
    }

    /// Dispose the subscription. Returns whether the listener was running.
    pub async fn stop(&self) -> Result<bool, TransportError> {
        let subscription = self
            .subscription
            .lock()
            .map_err(|_| TransportError::Poisoned("listener subscription"))?
            .take();
        let Some(subscription) = subscription else {
            return Ok(false);
        };
        subscription.dispose().await?;
        info!(event = E::NAME, group = %self.processor.group, "listener stopped");
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.subscription
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|subscription| !subscription.is_disposed()))
            .unwrap_or(false)
    }

    /// Process one message as if the transport had delivered it.
    pub async fn handle(&self, message: Message) -> Result<Disposition, HandlerError> {
        self.processor.process(message).await
    }

    pub fn stats(&self) -> ListenerStats {
        self.processor.counters.snapshot()
    }
}
