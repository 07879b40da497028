//! Broker living inside the process: a queue per (topic, group).
//!
//! Groups are created on first subscribe and keep their queue after the last
//! consumer leaves, which gives the same durable-subscription semantics as
//! the networked backends. There is no connection to lose, so this backend
//! never reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::handler::{invoke, redelivery_pause, Outcome};
use super::subscription::SubscriptionRegistry;
use super::{
    Backend, Message, MessageHandler, MessagingTransport, Subscription, SubscriptionKey, TransportConfig,
    TransportError,
};

/// Queue shared by the competing consumers of one group.
struct GroupQueue {
    sender: mpsc::UnboundedSender<Message>,
    /// Fair mutex: waiting consumers take turns, which spreads messages
    /// evenly across them.
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl GroupQueue {
    fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        })
    }

    fn push(&self, message: Message) {
        // the queue owns its receiver, so the channel cannot be closed
        let _ = self.sender.send(message);
    }
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, HashMap<String, Arc<GroupQueue>>>,
}

/// In-memory broker shared by every [`InProcessTransport`] built on it.
#[derive(Clone, Default)]
pub struct InProcessBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic_exists(&self, topic: &str) -> Result<bool, TransportError> {
        Ok(self.lock()?.topics.contains_key(topic))
    }

    pub fn create_topic(&self, topic: &str) -> Result<(), TransportError> {
        self.lock()?.topics.entry(topic.to_string()).or_default();
        Ok(())
    }

    pub fn group_exists(&self, topic: &str, group: &str) -> Result<bool, TransportError> {
        Ok(self
            .lock()?
            .topics
            .get(topic)
            .is_some_and(|groups| groups.contains_key(group)))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BrokerState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Poisoned("in-process broker"))
    }

    /// Copy the message into every group of the topic.
    fn publish(&self, topic: &str, message: Message) -> Result<usize, TransportError> {
        let state = self.lock()?;
        let groups = state
            .topics
            .get(topic)
            .ok_or_else(|| TransportError::TopicNotFound {
                topic: topic.to_string(),
            })?;
        for queue in groups.values() {
            queue.push(message.clone());
        }
        Ok(groups.len())
    }

    fn group(&self, topic: &str, group: &str) -> Result<Arc<GroupQueue>, TransportError> {
        let mut state = self.lock()?;
        let groups = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::TopicNotFound {
                topic: topic.to_string(),
            })?;
        Ok(Arc::clone(groups.entry(group.to_string()).or_insert_with(GroupQueue::new)))
    }
}

pub struct InProcessTransport {
    broker: InProcessBroker,
    config: TransportConfig,
    subscriptions: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
}

impl InProcessTransport {
    pub fn new(broker: InProcessBroker, config: TransportConfig) -> Self {
        Self {
            broker,
            config,
            subscriptions: SubscriptionRegistry::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn broker(&self) -> &InProcessBroker {
        &self.broker
    }

    fn ensure_topic(&self, topic: &str) -> Result<(), TransportError> {
        if self.broker.topic_exists(topic)? {
            return Ok(());
        }
        if !self.config.auto_create_topics {
            return Err(TransportError::TopicNotFound {
                topic: topic.to_string(),
            });
        }
        self.broker.create_topic(topic)?;
        info!(topic = %topic, "created topic");
        Ok(())
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Disposed);
        }
        Ok(())
    }
}

#[async_trait]
impl MessagingTransport for InProcessTransport {
    fn backend(&self) -> Backend {
        Backend::InProcess
    }

    async fn publish(&self, topic: &str, mut message: Message) -> Result<(), TransportError> {
        self.check_open()?;
        self.ensure_topic(topic)?;
        message.topic = topic.to_string();
        let groups = self.broker.publish(topic, message)?;
        debug!(topic = %topic, groups, "published");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, TransportError> {
        self.check_open()?;
        let key = SubscriptionKey::new(topic, group);
        self.subscriptions.reserve(&key)?;

        let queue = match self.ensure_topic(topic).and_then(|()| self.broker.group(topic, group)) {
            Ok(queue) => queue,
            Err(err) => {
                self.subscriptions.abandon(&key);
                return Err(err);
            }
        };

        let token = self.shutdown.child_token();
        let task = tokio::spawn(consume(
            queue,
            handler,
            self.config.clone(),
            key.clone(),
            token.clone(),
        ));
        info!(topic = %topic, group = %group, "subscribed");
        Ok(self.subscriptions.activate(key, token, task))
    }

    async fn dispose(&self) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();
        for subscription in self.subscriptions.drain() {
            subscription.dispose().await?;
        }
        info!(backend = %Backend::InProcess, "transport disposed");
        Ok(())
    }
}

async fn consume(
    queue: Arc<GroupQueue>,
    handler: Arc<dyn MessageHandler>,
    config: TransportConfig,
    key: SubscriptionKey,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            message = async { queue.receiver.lock().await.recv().await } => message,
        };
        let Some(mut message) = next else { break };
        message.delivery_attempt += 1;

        match invoke(handler.as_ref(), message.clone(), config.ack_timeout(), &token).await {
            Outcome::Ack => {}
            Outcome::Nack(reason) => {
                debug!(subscription = %key, message_id = %message.id, reason = %reason, "message nacked, requeueing");
                let keep_running = redelivery_pause(config.redelivery_delay(), &token).await;
                queue.push(message);
                if !keep_running {
                    break;
                }
            }
            Outcome::Cancelled => {
                queue.push(message);
                break;
            }
        }
    }
}
