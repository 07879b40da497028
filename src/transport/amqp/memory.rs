use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::client::{AmqpChannel, AmqpConnector, AmqpDelivery, AmqpMessage, DeliveryStream};
use crate::transport::{ConnectionParams, TransportError};

struct Pending {
    message: AmqpMessage,
    delivery_count: u32,
}

struct Consumer {
    tag: String,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<AmqpDelivery>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    pending: Pending,
    consumer_tag: String,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Pending>,
    /// Rotated on every delivery for round-robin dispatch.
    consumers: VecDeque<Consumer>,
    unacked: HashMap<u64, Unacked>,
}

impl Queue {
    fn requeue(&mut self, tag: u64) -> Option<String> {
        let unacked = self.unacked.remove(&tag)?;
        self.ready.push_front(unacked.pending);
        Some(unacked.consumer_tag)
    }

    fn settle_consumer(&mut self, consumer_tag: &str) {
        if let Some(consumer) = self.consumers.iter_mut().find(|c| c.tag == consumer_tag) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
    }

    /// Hand ready messages to consumers with spare prefetch.
    fn pump(&mut self, queue_name: &str, next_tag: &mut u64, tags: &mut HashMap<u64, String>) {
        while !self.ready.is_empty() {
            let Some(position) = self.consumers.iter().position(Consumer::has_capacity) else {
                break;
            };
            let Some(mut consumer) = self.consumers.remove(position) else {
                break;
            };
            let Some(mut pending) = self.ready.pop_front() else {
                self.consumers.push_back(consumer);
                break;
            };

            *next_tag += 1;
            let delivery_tag = *next_tag;
            pending.delivery_count += 1;
            let delivery = AmqpDelivery {
                delivery_tag,
                redelivered: pending.delivery_count > 1,
                delivery_count: pending.delivery_count,
                message: pending.message.clone(),
            };

            if consumer.sender.send(delivery).is_err() {
                // consumer went away without cancelling
                pending.delivery_count -= 1;
                self.ready.push_front(pending);
                self.requeue_consumer(&consumer.tag, tags);
                continue;
            }

            consumer.in_flight += 1;
            self.unacked.insert(
                delivery_tag,
                Unacked {
                    pending,
                    consumer_tag: consumer.tag.clone(),
                },
            );
            tags.insert(delivery_tag, queue_name.to_string());
            self.consumers.push_back(consumer);
        }
    }

    /// Return every unacknowledged delivery of a consumer to the queue.
    fn requeue_consumer(&mut self, consumer_tag: &str, tags: &mut HashMap<u64, String>) {
        let mut owned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.consumer_tag == consumer_tag)
            .map(|(tag, _)| *tag)
            .collect();
        owned.sort_unstable_by(|a, b| b.cmp(a));
        for tag in owned {
            self.requeue(tag);
            tags.remove(&tag);
        }
    }
}

#[derive(Default)]
struct BrokerState {
    /// Bumped when connections are severed; channels of older epochs are dead.
    epoch: u64,
    unreachable: bool,
    credentials: Option<(String, String)>,
    connections: usize,
    exchanges: HashMap<String, HashSet<String>>,
    queues: HashMap<String, Queue>,
    next_tag: u64,
    /// Delivery tag to queue name.
    tags: HashMap<u64, String>,
}

impl BrokerState {
    fn pump(&mut self, queue_name: &str) {
        let BrokerState {
            queues,
            next_tag,
            tags,
            ..
        } = self;
        if let Some(queue) = queues.get_mut(queue_name) {
            queue.pump(queue_name, next_tag, tags);
        }
    }

    fn queue_for_tag(&mut self, delivery_tag: u64) -> Result<(String, &mut Queue), TransportError> {
        let name = self
            .tags
            .remove(&delivery_tag)
            .ok_or_else(|| TransportError::Broker(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}")))?;
        let queue = self
            .queues
            .get_mut(&name)
            .ok_or_else(|| TransportError::Broker(format!("NOT_FOUND - no queue '{name}'")))?;
        Ok((name, queue))
    }
}

/// Exchange/queue broker held in memory.
///
/// Behaves like a single RabbitMQ node as far as the transport can tell:
/// declarations are idempotent, queues are durable, unacknowledged
/// deliveries return to the head of the queue when their consumer or
/// connection goes away. Tests use [`sever_connections`] and
/// [`set_reachable`] to simulate outages.
///
/// [`sever_connections`]: MemoryAmqpBroker::sever_connections
/// [`set_reachable`]: MemoryAmqpBroker::set_reachable
#[derive(Clone, Default)]
pub struct MemoryAmqpBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryAmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require these credentials on connect.
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.credentials = Some((username.into(), password.into()));
        }
        self
    }

    /// Drop every open connection. Consumers' streams close and their
    /// unacknowledged deliveries are requeued.
    pub fn sever_connections(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.epoch += 1;
        let BrokerState { queues, tags, .. } = &mut *state;
        for queue in queues.values_mut() {
            let consumers: Vec<String> = queue.consumers.drain(..).map(|c| c.tag).collect();
            for tag in consumers {
                queue.requeue_consumer(&tag, tags);
            }
        }
    }

    /// While unreachable, connection attempts fail.
    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unreachable = !reachable;
        }
    }

    /// Successful connections so far.
    pub fn connection_count(&self) -> usize {
        self.state.lock().map(|state| state.connections).unwrap_or(0)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.exchanges.contains_key(exchange))
            .unwrap_or(false)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.queues.contains_key(queue))
            .unwrap_or(false)
    }

    /// Ready plus unacknowledged messages.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.queues.get(queue).map(|q| q.ready.len() + q.unacked.len()))
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.queues.get(queue).map(|q| q.consumers.len()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl AmqpConnector for MemoryAmqpBroker {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Poisoned("amqp broker"))?;
        if state.unreachable {
            return Err(TransportError::Connection(format!("{}: connection refused", params.address)));
        }
        if let Some((username, password)) = &state.credentials {
            let supplied = (params.username.as_deref(), params.password.as_deref());
            if supplied != (Some(username.as_str()), Some(password.as_str())) {
                return Err(TransportError::Connection("ACCESS_REFUSED - login was refused".into()));
            }
        }
        state.connections += 1;
        Ok(Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            epoch: state.epoch,
        }))
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    epoch: u64,
}

impl MemoryChannel {
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        let state = self
            .state
            .lock()
            .map_err(|_| TransportError::Poisoned("amqp broker"))?;
        if state.epoch != self.epoch {
            return Err(TransportError::ConnectionLost);
        }
        Ok(state)
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.state().is_ok()
    }

    async fn exchange_exists(&self, exchange: &str) -> Result<bool, TransportError> {
        Ok(self.state()?.exchanges.contains_key(exchange))
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        self.state()?.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.state()?.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), TransportError> {
        let mut state = self.state()?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Broker(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let bindings = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::Broker(format!("NOT_FOUND - no exchange '{exchange}'")))?;
        bindings.insert(queue.to_string());
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: AmqpMessage) -> Result<(), TransportError> {
        let mut state = self.state()?;
        let bound: Vec<String> = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::Broker(format!("NOT_FOUND - no exchange '{exchange}'")))?
            .iter()
            .cloned()
            .collect();
        for queue_name in bound {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.ready.push_back(Pending {
                    message: message.clone(),
                    delivery_count: 0,
                });
            }
            state.pump(&queue_name);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream, TransportError> {
        let mut state = self.state()?;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::Broker(format!("NOT_FOUND - no queue '{queue}'")))?;
        if target.consumers.iter().any(|c| c.tag == consumer_tag) {
            return Err(TransportError::Broker(format!("NOT_ALLOWED - duplicate consumer tag '{consumer_tag}'")));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        target.consumers.push_back(Consumer {
            tag: consumer_tag.to_string(),
            prefetch,
            in_flight: 0,
            sender,
        });
        state.pump(queue);
        Ok(receiver)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.state()?;
        let (name, queue) = state.queue_for_tag(delivery_tag)?;
        if let Some(unacked) = queue.unacked.remove(&delivery_tag) {
            queue.settle_consumer(&unacked.consumer_tag);
        }
        state.pump(&name);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.state()?;
        let (name, queue) = state.queue_for_tag(delivery_tag)?;
        let consumer_tag = if requeue {
            queue.requeue(delivery_tag)
        } else {
            queue.unacked.remove(&delivery_tag).map(|unacked| unacked.consumer_tag)
        };
        if let Some(consumer_tag) = consumer_tag {
            queue.settle_consumer(&consumer_tag);
        }
        state.pump(&name);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.state()?;
        let BrokerState { queues, tags, .. } = &mut *state;
        let mut touched = Vec::new();
        for (name, queue) in queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.tag != consumer_tag);
            if queue.consumers.len() != before {
                queue.requeue_consumer(consumer_tag, tags);
                touched.push(name.clone());
            }
        }
        for name in touched {
            state.pump(&name);
        }
        Ok(())
    }
}
