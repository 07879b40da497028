use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::{AmqpChannel, AmqpConnector, AmqpDelivery, AmqpMessage};
use crate::transport::connection::{Backoff, ConnectionManager, Connector};
use crate::transport::handler::{invoke, redelivery_pause, Outcome};
use crate::transport::subscription::SubscriptionRegistry;
use crate::transport::topic_cache::TopicCache;
use crate::transport::{
    Backend, ConnectionParams, Message, MessageHandler, MessagingTransport, Subscription, SubscriptionKey,
    TransportConfig, TransportError,
};

const MESSAGE_TOPIC: &str = "x-topic";

/// Durable queue holding a group's messages.
pub fn queue_name(topic: &str, group: &str) -> String {
    format!("{topic}.{group}")
}

struct AmqpLink {
    connector: Arc<dyn AmqpConnector>,
    params: ConnectionParams,
}

#[async_trait]
impl Connector for AmqpLink {
    type Connection = Arc<dyn AmqpChannel>;

    async fn connect(&self) -> Result<Self::Connection, TransportError> {
        self.connector.connect(&self.params).await
    }

    fn is_open(connection: &Self::Connection) -> bool {
        connection.is_open()
    }
}

struct Shared {
    config: TransportConfig,
    connection: ConnectionManager<AmqpLink>,
    exchanges: TopicCache,
    subscriptions: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
}

impl Shared {
    async fn ensure_exchange(&self, channel: &Arc<dyn AmqpChannel>, topic: &str) -> Result<(), TransportError> {
        if self.exchanges.contains(topic) {
            return Ok(());
        }
        if !channel.exchange_exists(topic).await? {
            if !self.config.auto_create_topics {
                return Err(TransportError::TopicNotFound {
                    topic: topic.to_string(),
                });
            }
            channel.declare_exchange(topic).await?;
            info!(topic = %topic, "declared exchange");
        }
        self.exchanges.insert(topic);
        Ok(())
    }

    /// Exchange, durable queue and binding for a group.
    async fn provision(&self, channel: &Arc<dyn AmqpChannel>, key: &SubscriptionKey) -> Result<String, TransportError> {
        self.ensure_exchange(channel, &key.topic).await?;
        let queue = queue_name(&key.topic, &key.group);
        channel.declare_queue(&queue).await?;
        channel.bind_queue(&queue, &key.topic).await?;
        Ok(queue)
    }

    async fn publish_once(&self, topic: &str, message: &Message) -> Result<(), TransportError> {
        let lease = self.connection.acquire().await?;
        let result = async {
            self.ensure_exchange(&lease.connection, topic).await?;
            lease.connection.publish(topic, to_amqp(topic, message)).await
        }
        .await;
        if let Err(err) = &result {
            if err.is_connection_lost() {
                self.exchanges.clear();
                self.connection.invalidate(lease.generation).await;
            }
        }
        result
    }
}

fn to_amqp(topic: &str, message: &Message) -> AmqpMessage {
    let mut headers = message.metadata.clone();
    headers.insert(MESSAGE_TOPIC.to_string(), topic.to_string());
    AmqpMessage {
        message_id: message.id.clone(),
        body: message.payload.clone(),
        headers,
    }
}

fn from_delivery(topic: &str, delivery: &AmqpDelivery) -> Message {
    let mut metadata = delivery.message.headers.clone();
    metadata.remove(MESSAGE_TOPIC);
    Message {
        id: delivery.message.message_id.clone(),
        topic: topic.to_string(),
        payload: delivery.message.body.clone(),
        metadata,
        delivery_attempt: delivery.delivery_count,
    }
}

/// Transport for exchange/queue brokers.
pub struct AmqpTransport {
    shared: Arc<Shared>,
}

impl AmqpTransport {
    pub fn new(connector: Arc<dyn AmqpConnector>, config: TransportConfig) -> Self {
        let shutdown = CancellationToken::new();
        let link = AmqpLink {
            connector,
            params: config.connection_params(),
        };
        let shared = Shared {
            connection: ConnectionManager::new("amqp", link, config.reconnect.clone(), shutdown.clone()),
            exchanges: TopicCache::new(config.topic_cache_ttl()),
            subscriptions: SubscriptionRegistry::new(),
            shutdown,
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(TransportError::Disposed);
        }
        Ok(())
    }
}

#[async_trait]
impl MessagingTransport for AmqpTransport {
    fn backend(&self) -> Backend {
        Backend::Amqp
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        self.check_open()?;
        let shared = &self.shared;
        let timeout = shared.config.operation_timeout();
        let attempt = async {
            match shared.publish_once(topic, &message).await {
                Err(err) if err.is_connection_lost() => shared.publish_once(topic, &message).await,
                other => other,
            }
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                operation: "publish",
                after: timeout,
            }),
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, TransportError> {
        self.check_open()?;
        let shared = &self.shared;
        let key = SubscriptionKey::new(topic, group);
        shared.subscriptions.reserve(&key)?;

        let timeout = shared.config.operation_timeout();
        let provisioned = tokio::time::timeout(timeout, async {
            let lease = shared.connection.acquire().await?;
            shared.provision(&lease.connection, &key).await
        })
        .await
        .unwrap_or(Err(TransportError::Timeout {
            operation: "subscribe",
            after: timeout,
        }));
        let queue = match provisioned {
            Ok(queue) => queue,
            Err(err) => {
                shared.subscriptions.abandon(&key);
                return Err(err);
            }
        };

        let token = shared.shutdown.child_token();
        let task = tokio::spawn(consume(
            Arc::clone(shared),
            key.clone(),
            queue.clone(),
            handler,
            token.clone(),
        ));
        info!(topic = %topic, group = %group, queue = %queue, "subscribed");
        Ok(shared.subscriptions.activate(key, token, task))
    }

    async fn dispose(&self) -> Result<(), TransportError> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Ok(());
        }
        shared.shutdown.cancel();
        for subscription in shared.subscriptions.drain() {
            subscription.dispose().await?;
        }
        shared.connection.close().await;
        info!(backend = %Backend::Amqp, "transport disposed");
        Ok(())
    }
}

/// Consumer loop for one subscription. Survives connection loss by
/// re-provisioning and consuming again on the next connection.
async fn consume(
    shared: Arc<Shared>,
    key: SubscriptionKey,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    token: CancellationToken,
) {
    let consumer_tag = format!("{queue}-{}", Uuid::new_v4().simple());
    let prefetch = shared.config.amqp.prefetch;
    let mut backoff = Backoff::new(&shared.config.reconnect);
    let mut sessions = 0u32;

    'session: loop {
        let lease = tokio::select! {
            _ = token.cancelled() => return,
            lease = shared.connection.acquire() => lease,
        };
        let Ok(lease) = lease else {
            return;
        };
        let channel = Arc::clone(&lease.connection);

        let started = async {
            shared.provision(&channel, &key).await?;
            channel.consume(&queue, &consumer_tag, prefetch).await
        }
        .await;
        let mut deliveries = match started {
            Ok(deliveries) => deliveries,
            Err(err) => {
                warn!(subscription = %key, error = %err, "failed to start consumer");
                if err.is_connection_lost() {
                    shared.exchanges.clear();
                    shared.connection.invalidate(lease.generation).await;
                }
                if !backoff.wait(&token).await {
                    return;
                }
                continue 'session;
            }
        };

        sessions += 1;
        if sessions > 1 {
            info!(subscription = %key, "consumer resumed after reconnect");
        }
        backoff = Backoff::new(&shared.config.reconnect);

        loop {
            let delivery = tokio::select! {
                _ = token.cancelled() => {
                    release(&channel, &consumer_tag).await;
                    return;
                }
                delivery = deliveries.recv() => delivery,
            };
            let Some(delivery) = delivery else {
                shared.exchanges.clear();
                shared.connection.invalidate(lease.generation).await;
                if !backoff.wait(&token).await {
                    return;
                }
                continue 'session;
            };

            let message = from_delivery(&key.topic, &delivery);
            match invoke(handler.as_ref(), message, shared.config.ack_timeout(), &token).await {
                Outcome::Ack => {
                    if let Err(err) = channel.ack(delivery.delivery_tag).await {
                        warn!(subscription = %key, error = %err, "ack failed; broker will redeliver");
                    }
                }
                Outcome::Nack(reason) => {
                    debug!(subscription = %key, message_id = %delivery.message.message_id, reason = %reason, "message nacked");
                    let keep_running = redelivery_pause(shared.config.redelivery_delay(), &token).await;
                    if let Err(err) = channel.nack(delivery.delivery_tag, true).await {
                        warn!(subscription = %key, error = %err, "nack failed; broker will redeliver");
                    }
                    if !keep_running {
                        release(&channel, &consumer_tag).await;
                        return;
                    }
                }
                Outcome::Cancelled => {
                    let _ = channel.nack(delivery.delivery_tag, true).await;
                    release(&channel, &consumer_tag).await;
                    return;
                }
            }
        }
    }
}

async fn release(channel: &Arc<dyn AmqpChannel>, consumer_tag: &str) {
    if let Err(err) = channel.cancel(consumer_tag).await {
        debug!(consumer = %consumer_tag, error = %err, "consumer cancel failed");
    }
}
