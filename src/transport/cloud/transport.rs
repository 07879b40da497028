use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{CloudClient, CloudConnector, CloudMessage, ReceivedMessage};
use crate::transport::connection::{Backoff, ConnectionManager, Connector, Lease};
use crate::transport::handler::{invoke, redelivery_pause, Outcome};
use crate::transport::subscription::SubscriptionRegistry;
use crate::transport::topic_cache::TopicCache;
use crate::transport::{
    Backend, ConnectionParams, Message, MessageHandler, MessagingTransport, Subscription, SubscriptionKey,
    TransportConfig, TransportError,
};

struct CloudLink {
    connector: Arc<dyn CloudConnector>,
    params: ConnectionParams,
}

#[async_trait]
impl Connector for CloudLink {
    type Connection = Arc<dyn CloudClient>;

    async fn connect(&self) -> Result<Self::Connection, TransportError> {
        self.connector.connect(&self.params).await
    }

    fn is_open(connection: &Self::Connection) -> bool {
        connection.is_open()
    }
}

struct Shared {
    config: TransportConfig,
    connection: ConnectionManager<CloudLink>,
    topics: TopicCache,
    subscriptions: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
}

impl Shared {
    async fn ensure_topic(&self, client: &Arc<dyn CloudClient>, topic: &str) -> Result<(), TransportError> {
        if self.topics.contains(topic) {
            return Ok(());
        }
        if !client.topic_exists(topic).await? {
            if !self.config.auto_create_topics {
                return Err(TransportError::TopicNotFound {
                    topic: topic.to_string(),
                });
            }
            client.create_topic(topic).await?;
            info!(topic = %topic, "created topic");
        }
        self.topics.insert(topic);
        Ok(())
    }

    /// Topic plus the group's named subscription.
    async fn provision(&self, client: &Arc<dyn CloudClient>, key: &SubscriptionKey) -> Result<(), TransportError> {
        self.ensure_topic(client, &key.topic).await?;
        if !client.subscription_exists(&key.topic, &key.group).await? {
            client
                .create_subscription(&key.topic, &key.group, self.config.cloud.lock_duration())
                .await?;
            info!(topic = %key.topic, subscription = %key.group, "created subscription");
        }
        Ok(())
    }

    async fn publish_once(&self, topic: &str, message: &Message) -> Result<(), TransportError> {
        let lease = self.connection.acquire().await?;
        let result = async {
            self.ensure_topic(&lease.connection, topic).await?;
            let outgoing = CloudMessage {
                message_id: message.id.clone(),
                body: message.payload.clone(),
                properties: message.metadata.clone(),
            };
            lease.connection.send(topic, outgoing).await
        }
        .await;
        self.on_error(&lease, &result).await;
        result
    }

    async fn on_error<T>(&self, lease: &Lease<Arc<dyn CloudClient>>, result: &Result<T, TransportError>) {
        if let Err(err) = result {
            if err.is_connection_lost() {
                self.topics.clear();
                self.connection.invalidate(lease.generation).await;
            }
        }
    }
}

fn from_received(topic: &str, received: &ReceivedMessage) -> Message {
    Message {
        id: received.message.message_id.clone(),
        topic: topic.to_string(),
        payload: received.message.body.clone(),
        metadata: received.message.properties.clone(),
        delivery_attempt: received.delivery_count,
    }
}

/// Transport for topic/subscription cloud queueing services.
pub struct CloudTransport {
    shared: Arc<Shared>,
}

impl CloudTransport {
    pub fn new(connector: Arc<dyn CloudConnector>, config: TransportConfig) -> Self {
        let shutdown = CancellationToken::new();
        let link = CloudLink {
            connector,
            params: config.connection_params(),
        };
        let shared = Shared {
            connection: ConnectionManager::new("cloud", link, config.reconnect.clone(), shutdown.clone()),
            topics: TopicCache::new(config.topic_cache_ttl()),
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
impl MessagingTransport for CloudTransport {
    fn backend(&self) -> Backend {
        Backend::Cloud
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
        tokio::time::timeout(timeout, attempt)
            .await
            .unwrap_or(Err(TransportError::Timeout {
                operation: "publish",
                after: timeout,
            }))
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
            let result = shared.provision(&lease.connection, &key).await;
            shared.on_error(&lease, &result).await;
            result
        })
        .await
        .unwrap_or(Err(TransportError::Timeout {
            operation: "subscribe",
            after: timeout,
        }));
        if let Err(err) = provisioned {
            shared.subscriptions.abandon(&key);
            return Err(err);
        }

        let token = shared.shutdown.child_token();
        let task = tokio::spawn(consume(Arc::clone(shared), key.clone(), handler, token.clone()));
        info!(topic = %topic, group = %group, "subscribed");
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
        info!(backend = %Backend::Cloud, "transport disposed");
        Ok(())
    }
}

async fn abandon(client: &Arc<dyn CloudClient>, key: &SubscriptionKey, received: &ReceivedMessage) {
    if let Err(err) = client.abandon(&key.topic, &key.group, received.lock_token).await {
        warn!(subscription = %key, error = %err, "abandon failed; lock expiry will redeliver");
    }
}

/// Receive loop for one subscription. A receive is never interrupted, so a
/// message that arrives as the consumer is cancelled is abandoned rather
/// than lost.
async fn consume(
    shared: Arc<Shared>,
    key: SubscriptionKey,
    handler: Arc<dyn MessageHandler>,
    token: CancellationToken,
) {
    let receive_wait = shared.config.cloud.receive_wait();
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
        let client = Arc::clone(&lease.connection);

        let provisioned = shared.provision(&client, &key).await;
        if let Err(err) = &provisioned {
            warn!(subscription = %key, error = %err, "failed to open receiver");
            shared.on_error(&lease, &provisioned).await;
            if !backoff.wait(&token).await {
                return;
            }
            continue 'session;
        }

        sessions += 1;
        if sessions > 1 {
            info!(subscription = %key, "receiver resumed after reconnect");
        }

        loop {
            if token.is_cancelled() {
                return;
            }
            let received = client.receive(&key.topic, &key.group, receive_wait).await;
            if received.is_ok() && backoff.attempts() > 0 {
                backoff = Backoff::new(&shared.config.reconnect);
            }
            let received = match received {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                Err(err) => {
                    warn!(subscription = %key, error = %err, "receive failed");
                    shared.on_error(&lease, &Err::<(), _>(err)).await;
                    if !backoff.wait(&token).await {
                        return;
                    }
                    continue 'session;
                }
            };
            if token.is_cancelled() {
                abandon(&client, &key, &received).await;
                return;
            }

            let message = from_received(&key.topic, &received);
            match invoke(handler.as_ref(), message, shared.config.ack_timeout(), &token).await {
                Outcome::Ack => {
                    if let Err(err) = client.complete(&key.topic, &key.group, received.lock_token).await {
                        warn!(subscription = %key, error = %err, "complete failed; message will be redelivered");
                    }
                }
                Outcome::Nack(reason) => {
                    debug!(subscription = %key, message_id = %received.message.message_id, reason = %reason, "message abandoned");
                    let keep_running = redelivery_pause(shared.config.redelivery_delay(), &token).await;
                    abandon(&client, &key, &received).await;
                    if !keep_running {
                        return;
                    }
                }
                Outcome::Cancelled => {
                    abandon(&client, &key, &received).await;
                    return;
                }
            }
        }
    }
}
