use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use super::client::{CloudClient, CloudConnector, CloudMessage, ReceivedMessage};
use crate::transport::{ConnectionParams, TransportError};

struct Stored {
    message: CloudMessage,
    delivery_count: u32,
}

struct Locked {
    stored: Stored,
    until: Instant,
}

struct SubscriptionState {
    lock_duration: Duration,
    available: VecDeque<Stored>,
    locked: HashMap<Uuid, Locked>,
    /// Receivers parked in `receive`, served in arrival order.
    waiters: VecDeque<oneshot::Sender<ReceivedMessage>>,
}

impl SubscriptionState {
    fn new(lock_duration: Duration) -> Self {
        Self {
            lock_duration,
            available: VecDeque::new(),
            locked: HashMap::new(),
            waiters: VecDeque::new(),
        }
    }

    fn lock(&mut self, mut stored: Stored) -> ReceivedMessage {
        stored.delivery_count += 1;
        let lock_token = Uuid::new_v4();
        let received = ReceivedMessage {
            lock_token,
            delivery_count: stored.delivery_count,
            message: stored.message.clone(),
        };
        self.locked.insert(
            lock_token,
            Locked {
                stored,
                until: Instant::now() + self.lock_duration,
            },
        );
        received
    }

    /// Hand a message to the longest waiting receiver, or park it.
    fn offer(&mut self, stored: Stored, front: bool) {
        let mut stored = stored;
        while let Some(waiter) = self.waiters.pop_front() {
            let received = self.lock(stored);
            let lock_token = received.lock_token;
            match waiter.send(received) {
                Ok(()) => return,
                Err(_) => {
                    // receiver gave up; undo the lock and try the next one
                    let Some(locked) = self.locked.remove(&lock_token) else {
                        return;
                    };
                    stored = locked.stored;
                    stored.delivery_count -= 1;
                }
            }
        }
        if front {
            self.available.push_front(stored);
        } else {
            self.available.push_back(stored);
        }
    }

    fn expire_locks(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.until <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                self.available.push_front(locked.stored);
            }
        }
    }

    /// Locks taken through a severed connection return to the queue.
    fn drop_session(&mut self) {
        self.waiters.clear();
        for (_, locked) in self.locked.drain() {
            self.available.push_front(locked.stored);
        }
    }
}

#[derive(Default)]
struct BrokerState {
    epoch: u64,
    unreachable: bool,
    credentials: Option<(String, String)>,
    connections: usize,
    topics: HashMap<String, HashMap<String, SubscriptionState>>,
}

/// Topics and peek-lock subscriptions held in memory.
///
/// Lock expiry is measured with the tokio clock, so paused-time tests can
/// advance past it.
#[derive(Clone, Default)]
pub struct MemoryCloudBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryCloudBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.credentials = Some((username.into(), password.into()));
        }
        self
    }

    /// Drop every open connection. Parked receivers fail and messages
    /// locked by them become available again.
    pub fn sever_connections(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.epoch += 1;
        for subscriptions in state.topics.values_mut() {
            for subscription in subscriptions.values_mut() {
                subscription.drop_session();
            }
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unreachable = !reachable;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().map(|state| state.connections).unwrap_or(0)
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.topics.contains_key(topic))
            .unwrap_or(false)
    }

    pub fn has_subscription(&self, topic: &str, subscription: &str) -> bool {
        self.state
            .lock()
            .map(|state| {
                state
                    .topics
                    .get(topic)
                    .is_some_and(|subscriptions| subscriptions.contains_key(subscription))
            })
            .unwrap_or(false)
    }

    /// Messages in a subscription that have not been completed.
    pub fn active_message_count(&self, topic: &str, subscription: &str) -> usize {
        let Ok(state) = self.state.lock() else {
            return 0;
        };
        state
            .topics
            .get(topic)
            .and_then(|subscriptions| subscriptions.get(subscription))
            .map(|subscription| subscription.available.len() + subscription.locked.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CloudConnector for MemoryCloudBroker {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn CloudClient>, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Poisoned("cloud broker"))?;
        if state.unreachable {
            return Err(TransportError::Connection(format!(
                "{}: the service is unavailable",
                params.address
            )));
        }
        if let Some((username, password)) = &state.credentials {
            let supplied = (params.username.as_deref(), params.password.as_deref());
            if supplied != (Some(username.as_str()), Some(password.as_str())) {
                return Err(TransportError::Connection("unauthorized: invalid shared access key".into()));
            }
        }
        state.connections += 1;
        Ok(Arc::new(MemoryCloudClient {
            state: Arc::clone(&self.state),
            epoch: state.epoch,
        }))
    }
}

struct MemoryCloudClient {
    state: Arc<Mutex<BrokerState>>,
    epoch: u64,
}

fn entity_not_found(path: String) -> TransportError {
    TransportError::Broker(format!("MessagingEntityNotFound: {path}"))
}

impl MemoryCloudClient {
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        let state = self
            .state
            .lock()
            .map_err(|_| TransportError::Poisoned("cloud broker"))?;
        if state.epoch != self.epoch {
            return Err(TransportError::ConnectionLost);
        }
        Ok(state)
    }

    fn with_subscription<T>(
        &self,
        topic: &str,
        subscription: &str,
        f: impl FnOnce(&mut SubscriptionState) -> T,
    ) -> Result<T, TransportError> {
        let mut state = self.state()?;
        let entry = state
            .topics
            .get_mut(topic)
            .and_then(|subscriptions| subscriptions.get_mut(subscription))
            .ok_or_else(|| entity_not_found(format!("{topic}/subscriptions/{subscription}")))?;
        Ok(f(entry))
    }
}

#[async_trait]
impl CloudClient for MemoryCloudClient {
    fn is_open(&self) -> bool {
        self.state().is_ok()
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError> {
        Ok(self.state()?.topics.contains_key(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<(), TransportError> {
        self.state()?.topics.entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool, TransportError> {
        Ok(self
            .state()?
            .topics
            .get(topic)
            .is_some_and(|subscriptions| subscriptions.contains_key(subscription)))
    }

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        lock_duration: Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.state()?;
        let subscriptions = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| entity_not_found(topic.to_string()))?;
        subscriptions
            .entry(subscription.to_string())
            .or_insert_with(|| SubscriptionState::new(lock_duration));
        Ok(())
    }

    async fn send(&self, topic: &str, message: CloudMessage) -> Result<(), TransportError> {
        let mut state = self.state()?;
        let subscriptions = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| entity_not_found(topic.to_string()))?;
        for subscription in subscriptions.values_mut() {
            subscription.offer(
                Stored {
                    message: message.clone(),
                    delivery_count: 0,
                },
                false,
            );
        }
        Ok(())
    }

    async fn receive(
        &self,
        topic: &str,
        subscription: &str,
        max_wait: Duration,
    ) -> Result<Option<ReceivedMessage>, TransportError> {
        let parked = self.with_subscription(topic, subscription, |entry| {
            entry.expire_locks(Instant::now());
            if let Some(stored) = entry.available.pop_front() {
                return Ok(entry.lock(stored));
            }
            let (sender, receiver) = oneshot::channel();
            entry.waiters.push_back(sender);
            Err(receiver)
        })?;
        let mut receiver = match parked {
            Ok(received) => return Ok(Some(received)),
            Err(receiver) => receiver,
        };

        match tokio::time::timeout(max_wait, &mut receiver).await {
            Ok(Ok(received)) => Ok(Some(received)),
            // sender dropped: the session was severed
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => {
                receiver.close();
                Ok(receiver.try_recv().ok())
            }
        }
    }

    async fn complete(&self, topic: &str, subscription: &str, lock_token: Uuid) -> Result<(), TransportError> {
        self.with_subscription(topic, subscription, |entry| {
            entry
                .locked
                .remove(&lock_token)
                .map(|_| ())
                .ok_or_else(|| TransportError::Broker(format!("MessageLockLost: {lock_token}")))
        })?
    }

    async fn abandon(&self, topic: &str, subscription: &str, lock_token: Uuid) -> Result<(), TransportError> {
        self.with_subscription(topic, subscription, |entry| {
            let locked = entry
                .locked
                .remove(&lock_token)
                .ok_or_else(|| TransportError::Broker(format!("MessageLockLost: {lock_token}")))?;
            entry.offer(locked.stored, true);
            Ok(())
        })?
    }
}
