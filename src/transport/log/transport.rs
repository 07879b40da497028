use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::{LogClient, LogConnector, LogEntry, LogRecord};
use crate::transport::connection::{Backoff, ConnectionManager, Connector, Lease};
use crate::transport::handler::{invoke, redelivery_pause, Outcome};
use crate::transport::subscription::SubscriptionRegistry;
use crate::transport::topic_cache::TopicCache;
use crate::transport::{
    Backend, ConnectionParams, Message, MessageHandler, MessagingTransport, Subscription, SubscriptionKey,
    TransportConfig, TransportError,
};

const MESSAGE_ID: &str = "message-id";

struct LogLink {
    connector: Arc<dyn LogConnector>,
    params: ConnectionParams,
}

#[async_trait]
impl Connector for LogLink {
    type Connection = Arc<dyn LogClient>;

    async fn connect(&self) -> Result<Self::Connection, TransportError> {
        self.connector.connect(&self.params).await
    }

    fn is_open(connection: &Self::Connection) -> bool {
        connection.is_open()
    }
}

struct Shared {
    config: TransportConfig,
    connection: ConnectionManager<LogLink>,
    topics: TopicCache,
    subscriptions: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
}

impl Shared {
    async fn ensure_topic(&self, client: &Arc<dyn LogClient>, topic: &str) -> Result<(), TransportError> {
        if self.topics.contains(topic) {
            return Ok(());
        }
        if !client.topic_exists(topic).await? {
            if !self.config.auto_create_topics {
                return Err(TransportError::TopicNotFound {
                    topic: topic.to_string(),
                });
            }
            client.create_topic(topic, self.config.log.partitions).await?;
            info!(topic = %topic, partitions = self.config.log.partitions, "created topic");
        }
        self.topics.insert(topic);
        Ok(())
    }

    async fn publish_once(&self, topic: &str, message: &Message) -> Result<(), TransportError> {
        let lease = self.connection.acquire().await?;
        let result = async {
            self.ensure_topic(&lease.connection, topic).await?;
            let mut headers = message.metadata.clone();
            headers.insert(MESSAGE_ID.to_string(), message.id.clone());
            let record = LogRecord {
                key: None,
                payload: message.payload.clone(),
                headers,
            };
            let (partition, offset) = lease.connection.produce(topic, record).await?;
            debug!(topic = %topic, partition, offset, "produced");
            Ok(())
        }
        .await;
        self.on_error(&lease, &result).await;
        result
    }

    async fn on_error<T>(&self, lease: &Lease<Arc<dyn LogClient>>, result: &Result<T, TransportError>) {
        if let Err(err) = result {
            if err.is_connection_lost() {
                self.topics.clear();
                self.connection.invalidate(lease.generation).await;
            }
        }
    }
}

fn to_message(topic: &str, entry: &LogEntry, attempt: u32) -> Message {
    let mut metadata = entry.record.headers.clone();
    let id = metadata
        .remove(MESSAGE_ID)
        .unwrap_or_else(|| format!("{topic}/{}/{}", entry.partition, entry.offset));
    Message {
        id,
        topic: topic.to_string(),
        payload: entry.record.payload.clone(),
        metadata,
        delivery_attempt: attempt,
    }
}

/// Transport for partitioned log brokers.
pub struct LogTransport {
    shared: Arc<Shared>,
}

impl LogTransport {
    pub fn new(connector: Arc<dyn LogConnector>, config: TransportConfig) -> Self {
        let shutdown = CancellationToken::new();
        let link = LogLink {
            connector,
            params: config.connection_params(),
        };
        let shared = Shared {
            connection: ConnectionManager::new("log", link, config.reconnect.clone(), shutdown.clone()),
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
impl MessagingTransport for LogTransport {
    fn backend(&self) -> Backend {
        Backend::Log
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
        let member_id = format!("{group}-{}", Uuid::new_v4().simple());

        let timeout = shared.config.operation_timeout();
        let joined = tokio::time::timeout(timeout, async {
            let lease = shared.connection.acquire().await?;
            let result = async {
                shared.ensure_topic(&lease.connection, topic).await?;
                lease.connection.join_group(topic, group, &member_id).await
            }
            .await;
            shared.on_error(&lease, &result).await;
            result
        })
        .await
        .unwrap_or(Err(TransportError::Timeout {
            operation: "subscribe",
            after: timeout,
        }));
        if let Err(err) = joined {
            shared.subscriptions.abandon(&key);
            return Err(err);
        }

        let token = shared.shutdown.child_token();
        let task = tokio::spawn(consume(
            Arc::clone(shared),
            key.clone(),
            member_id.clone(),
            handler,
            token.clone(),
        ));
        info!(topic = %topic, group = %group, member = %member_id, "subscribed");
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
        info!(backend = %Backend::Log, "transport disposed");
        Ok(())
    }
}

/// How a poll of the assigned partitions ended.
enum Poll {
    Progressed,
    Idle,
    /// The connection failed; start a new session.
    Lost,
    Stopped,
}

struct Member {
    shared: Arc<Shared>,
    key: SubscriptionKey,
    member_id: String,
    handler: Arc<dyn MessageHandler>,
    token: CancellationToken,
    /// Delivery attempts of records not yet committed.
    attempts: HashMap<(u32, u64), u32>,
}

impl Member {
    async fn poll(&mut self, lease: &Lease<Arc<dyn LogClient>>, positions: &mut Positions) -> Poll {
        let client = &lease.connection;
        let (topic, group) = (self.key.topic.clone(), self.key.group.clone());

        let assignment = match client.assignment(&topic, &group, &self.member_id).await {
            Ok(assignment) => assignment,
            Err(err) => return self.failed(lease, err, "assignment").await,
        };
        if positions.generation != Some(assignment.generation) {
            debug!(subscription = %self.key, generation = assignment.generation, partitions = ?assignment.partitions, "assignment changed");
            positions.generation = Some(assignment.generation);
            positions.offsets.clear();
        }

        let mut progressed = false;
        for partition in assignment.partitions {
            let position = match positions.offsets.get(&partition) {
                Some(position) => *position,
                None => match client.committed(&topic, &group, partition).await {
                    Ok(position) => position,
                    Err(err) => return self.failed(lease, err, "committed offset").await,
                },
            };
            let max_records = self.shared.config.log.max_poll_records;
            let entries = match client.fetch(&topic, &group, partition, position, max_records).await {
                Ok(entries) => entries,
                Err(err) => return self.failed(lease, err, "fetch").await,
            };

            for entry in entries {
                progressed = true;
                let attempt = {
                    let attempt = self.attempts.entry((partition, entry.offset)).or_insert(0);
                    *attempt += 1;
                    *attempt
                };
                let message = to_message(&topic, &entry, attempt);
                let config = &self.shared.config;

                match invoke(self.handler.as_ref(), message, config.ack_timeout(), &self.token).await {
                    Outcome::Ack => {
                        self.attempts.remove(&(partition, entry.offset));
                        if let Err(err) = client.commit(&topic, &group, partition, entry.offset + 1).await {
                            return self.failed(lease, err, "commit").await;
                        }
                        positions.offsets.insert(partition, entry.offset + 1);
                    }
                    Outcome::Nack(reason) => {
                        debug!(subscription = %self.key, partition, offset = entry.offset, reason = %reason, "record nacked");
                        if !redelivery_pause(config.redelivery_delay(), &self.token).await {
                            return Poll::Stopped;
                        }
                        // fetch the same offset again on the next poll
                        positions.offsets.insert(partition, entry.offset);
                        break;
                    }
                    Outcome::Cancelled => return Poll::Stopped,
                }
            }
        }

        if progressed {
            Poll::Progressed
        } else {
            Poll::Idle
        }
    }

    async fn failed(&self, lease: &Lease<Arc<dyn LogClient>>, err: TransportError, operation: &str) -> Poll {
        warn!(subscription = %self.key, operation, error = %err, "log consumer error");
        self.shared.on_error(lease, &Err::<(), _>(err)).await;
        Poll::Lost
    }

    async fn leave(&self, client: &Arc<dyn LogClient>) {
        if let Err(err) = client
            .leave_group(&self.key.topic, &self.key.group, &self.member_id)
            .await
        {
            debug!(subscription = %self.key, error = %err, "leave group failed");
        }
    }
}

#[derive(Default)]
struct Positions {
    generation: Option<u64>,
    offsets: HashMap<u32, u64>,
}

async fn consume(
    shared: Arc<Shared>,
    key: SubscriptionKey,
    member_id: String,
    handler: Arc<dyn MessageHandler>,
    token: CancellationToken,
) {
    let poll_interval = shared.config.log.poll_interval();
    let mut backoff = Backoff::new(&shared.config.reconnect);
    let mut member = Member {
        shared: Arc::clone(&shared),
        key,
        member_id,
        handler,
        token: token.clone(),
        attempts: HashMap::new(),
    };
    let mut sessions = 0u32;

    'session: loop {
        let lease = tokio::select! {
            _ = token.cancelled() => return,
            lease = shared.connection.acquire() => lease,
        };
        let Ok(lease) = lease else {
            return;
        };

        let joined = async {
            shared.ensure_topic(&lease.connection, &member.key.topic).await?;
            lease
                .connection
                .join_group(&member.key.topic, &member.key.group, &member.member_id)
                .await
        }
        .await;
        if let Err(err) = joined {
            warn!(subscription = %member.key, error = %err, "failed to join group");
            shared.on_error(&lease, &Err::<(), _>(err)).await;
            if !backoff.wait(&token).await {
                return;
            }
            continue 'session;
        }

        sessions += 1;
        if sessions > 1 {
            info!(subscription = %member.key, "consumer resumed after reconnect");
        }
        backoff = Backoff::new(&shared.config.reconnect);
        let mut positions = Positions::default();

        loop {
            if token.is_cancelled() {
                member.leave(&lease.connection).await;
                return;
            }
            match member.poll(&lease, &mut positions).await {
                Poll::Progressed => {}
                Poll::Idle => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                Poll::Lost => {
                    if !backoff.wait(&token).await {
                        member.leave(&lease.connection).await;
                        return;
                    }
                    continue 'session;
                }
                Poll::Stopped => {
                    member.leave(&lease.connection).await;
                    return;
                }
            }
        }
    }
}
