use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message as _, Offset, TopicPartitionList};
use tracing::{debug, info};

use super::client::{Assignment, LogClient, LogConnector, LogEntry, LogRecord};
use crate::transport::{ConnectionParams, TransportError};

/// Records buffered per partition before the partition is paused.
const BUFFER_LIMIT: usize = 256;
/// Records taken off the consumer queue per pump.
const PUMP_BATCH: usize = 64;
/// How long an assignment check waits for the consumer to make progress.
const REBALANCE_WAIT: Duration = Duration::from_millis(10);

/// [`LogConnector`] for Apache Kafka, built on librdkafka.
///
/// `address` is the bootstrap server list, optionally prefixed with
/// `kafka://`. Credentials switch the client to SASL/PLAIN. Any other
/// librdkafka property can be set with [`with_setting`](Self::with_setting).
///
/// Group members consume with `enable.auto.commit=false` and
/// `auto.offset.reset=latest`. Joining a group that has no committed offsets
/// commits the current end of every partition first, so the group sees
/// every record produced after the join.
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    settings: Vec<(String, String)>,
    replication: i32,
    request_timeout: Duration,
}

impl Default for KafkaConnector {
    fn default() -> Self {
        Self {
            settings: Vec::new(),
            replication: 1,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl KafkaConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.push((key.into(), value.into()));
        self
    }

    /// Replication factor of auto-created topics.
    pub fn with_replication(mut self, replication: i32) -> Self {
        self.replication = replication;
        self
    }

    /// Bound on metadata, offset and admin requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn client_config(&self, params: &ConnectionParams) -> ClientConfig {
        let servers = params.address.strip_prefix("kafka://").unwrap_or(&params.address);
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", servers);
        if let (Some(username), Some(password)) = (&params.username, &params.password) {
            config
                .set("security.protocol", "sasl_plaintext")
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }
        for (key, value) in &self.settings {
            config.set(key, value);
        }
        config
    }
}

#[async_trait]
impl LogConnector for KafkaConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn LogClient>, TransportError> {
        let config = self.client_config(params);
        let connection_failed = |err: KafkaError| TransportError::Connection(format!("{}: {err}", params.address));

        let admin: AdminClient<DefaultClientContext> = config.create().map_err(connection_failed)?;
        let producer: FutureProducer = config
            .clone()
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(connection_failed)?;

        let reachability = producer.clone();
        let timeout = self.request_timeout;
        blocking(move || reachability.client().fetch_metadata(None, timeout).map(|_| ()))
            .await
            .and_then(|result| result.map_err(connection_failed))?;
        info!(servers = %params.address, "connected to kafka");

        Ok(Arc::new(KafkaLogClient {
            config,
            admin,
            producer,
            members: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
            replication: self.replication,
            timeout,
        }))
    }
}

async fn blocking<T, F>(op: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| TransportError::Broker(format!("kafka task failed: {err}")))
}

fn to_entry(message: BorrowedMessage<'_>) -> LogEntry {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    let value = header.value.map(String::from_utf8_lossy).unwrap_or_default();
                    (header.key.to_string(), value.into_owned())
                })
                .collect()
        })
        .unwrap_or_default();
    LogEntry {
        partition: message.partition() as u32,
        offset: message.offset() as u64,
        record: LogRecord {
            key: message.key().map(|key| String::from_utf8_lossy(key).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            headers,
        },
    }
}

#[derive(Default)]
struct MemberState {
    generation: u64,
    partitions: Vec<u32>,
    buffers: HashMap<u32, VecDeque<LogEntry>>,
    /// Offset the consumer delivers next, per partition.
    next: HashMap<u32, u64>,
    /// Last seek target, per partition.
    sought: HashMap<u32, u64>,
    paused: HashSet<u32>,
}

impl MemberState {
    fn forget(&mut self, partition: u32) {
        self.buffers.remove(&partition);
        self.next.remove(&partition);
        self.sought.remove(&partition);
        self.paused.remove(&partition);
    }
}

/// One consumer-group member. Consumed records wait in per-partition
/// buffers until `fetch` hands them out, so a nacked record is served again
/// without going back to the broker.
struct GroupMember {
    topic: String,
    member_id: String,
    consumer: StreamConsumer,
    state: Mutex<MemberState>,
}

impl GroupMember {
    fn state(&self) -> Result<MutexGuard<'_, MemberState>, TransportError> {
        self.state.lock().map_err(|_| TransportError::Poisoned("kafka member"))
    }

    fn partitions(&self, partitions: impl IntoIterator<Item = u32>) -> KafkaResult<TopicPartitionList> {
        let mut list = TopicPartitionList::new();
        for partition in partitions {
            list.add_partition_offset(&self.topic, partition as i32, Offset::Invalid)?;
        }
        Ok(list)
    }

    /// Move whatever the consumer has ready into the buffers, waiting up to
    /// `wait` for the first record.
    async fn pump(&self, wait: Duration) -> Result<(), KafkaError> {
        let mut wait = wait;
        for _ in 0..PUMP_BATCH {
            let received = tokio::time::timeout(wait, self.consumer.recv()).await.map(|result| result.map(to_entry));
            let entry = match received {
                Err(_) => break,
                Ok(entry) => entry?,
            };
            self.buffer(entry)?;
            wait = Duration::ZERO;
        }
        Ok(())
    }

    fn buffer(&self, entry: LogEntry) -> KafkaResult<()> {
        let Ok(mut guard) = self.state.lock() else {
            return Ok(());
        };
        let state = &mut *guard;
        let partition = entry.partition;
        if state.next.get(&partition).is_some_and(|next| entry.offset < *next) {
            return Ok(());
        }
        state.next.insert(partition, entry.offset + 1);
        let buffer = state.buffers.entry(partition).or_default();
        buffer.push_back(entry);
        if buffer.len() >= BUFFER_LIMIT && state.paused.insert(partition) {
            self.consumer.pause(&self.partitions([partition])?)?;
        }
        Ok(())
    }

    /// Track the consumer's assignment, bumping the generation whenever the
    /// owned partitions change.
    fn assignment(&self) -> Result<Assignment, TransportError> {
        let assigned = self.consumer.assignment().map_err(|err| TransportError::Broker(err.to_string()))?;
        let mut partitions: Vec<u32> = assigned
            .elements_for_topic(&self.topic)
            .iter()
            .map(|element| element.partition() as u32)
            .collect();
        partitions.sort_unstable();

        let mut state = self.state()?;
        if state.partitions != partitions {
            let revoked: Vec<u32> = state
                .partitions
                .iter()
                .copied()
                .filter(|partition| !partitions.contains(partition))
                .collect();
            for partition in revoked {
                state.forget(partition);
            }
            state.generation += 1;
            state.partitions = partitions;
            debug!(member = %self.member_id, generation = state.generation, partitions = ?state.partitions, "kafka assignment changed");
        }
        Ok(Assignment {
            generation: state.generation,
            partitions: state.partitions.clone(),
        })
    }
}

struct KafkaLogClient {
    config: ClientConfig,
    admin: AdminClient<DefaultClientContext>,
    producer: FutureProducer,
    /// One member per (topic, group); the transport never holds two
    /// subscriptions for the same pair.
    members: Mutex<HashMap<(String, String), Arc<GroupMember>>>,
    open: AtomicBool,
    replication: i32,
    timeout: Duration,
}

impl KafkaLogClient {
    /// Map a client error, closing this client when the cluster is gone.
    fn classify(&self, err: KafkaError) -> TransportError {
        match classify(&err) {
            TransportError::Broker(_) => TransportError::Broker(err.to_string()),
            lost => {
                self.open.store(false, Ordering::SeqCst);
                lost
            }
        }
    }

    fn member(&self, topic: &str, group: &str) -> Result<Arc<GroupMember>, TransportError> {
        self.members
            .lock()
            .map_err(|_| TransportError::Poisoned("kafka members"))?
            .get(&(topic.to_string(), group.to_string()))
            .cloned()
            .ok_or_else(|| TransportError::Broker(format!("UNKNOWN_MEMBER_ID - no member of {group} on {topic}")))
    }

    fn group_config(&self, group: &str) -> ClientConfig {
        let mut config = self.config.clone();
        config
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "latest");
        config
    }

    /// Commit the log end for every partition the group has no offset for.
    async fn initialize_offsets(&self, topic: &str, group: &str) -> Result<(), TransportError> {
        let config = self.group_config(group);
        let (topic, group) = (topic.to_string(), group.to_string());
        let timeout = self.timeout;
        let result = blocking(move || -> KafkaResult<usize> {
            let consumer: BaseConsumer = config.create()?;
            let metadata = consumer.fetch_metadata(Some(&topic), timeout)?;
            let mut all = TopicPartitionList::new();
            for partition in metadata.topics().iter().flat_map(|meta| meta.partitions()) {
                all.add_partition(&topic, partition.id());
            }
            let committed = consumer.committed_offsets(all, timeout)?;

            let mut ends = TopicPartitionList::new();
            for element in committed.elements_for_topic(&topic) {
                if element.offset().to_raw().is_some_and(|offset| offset >= 0) {
                    continue;
                }
                let (_, high) = consumer.fetch_watermarks(&topic, element.partition(), timeout)?;
                ends.add_partition_offset(&topic, element.partition(), Offset::Offset(high))?;
            }
            if ends.count() == 0 {
                return Ok(0);
            }
            match consumer.commit(&ends, CommitMode::Sync) {
                Ok(()) => Ok(ends.count()),
                Err(err) => {
                    // an active member already owns the group's offsets
                    debug!(topic = %topic, group = %group, error = %err, "group offsets left to the group");
                    Ok(0)
                }
            }
        })
        .await?;
        match result {
            Ok(initialized) if initialized > 0 => {
                debug!(partitions = initialized, "group offsets initialized at log end");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) => Err(self.classify(err)),
        }
    }
}

#[async_trait]
impl LogClient for KafkaLogClient {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError> {
        let producer = self.producer.clone();
        let (name, timeout) = (topic.to_string(), self.timeout);
        let metadata = blocking(move || producer.client().fetch_metadata(Some(&name), timeout))
            .await?
            .map_err(|err| self.classify(err))?;
        Ok(metadata
            .topics()
            .iter()
            .any(|meta| meta.name() == topic && meta.error().is_none() && !meta.partitions().is_empty()))
    }

    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), TransportError> {
        let new_topic = NewTopic::new(topic, partitions as i32, TopicReplication::Fixed(self.replication));
        let options = AdminOptions::new().operation_timeout(Some(self.timeout));
        let results = self
            .admin
            .create_topics([&new_topic], &options)
            .await
            .map_err(|err| self.classify(err))?;
        for result in results {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => return Err(TransportError::Broker(format!("{code:?} - {name}"))),
            }
        }
        Ok(())
    }

    async fn produce(&self, topic: &str, record: LogRecord) -> Result<(u32, u64), TransportError> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }
        let mut outgoing: FutureRecord<'_, str, [u8]> =
            FutureRecord::to(topic).payload(record.payload.as_slice()).headers(headers);
        if let Some(key) = &record.key {
            outgoing = outgoing.key(key.as_str());
        }
        match self.producer.send(outgoing, self.timeout).await {
            Ok((partition, offset)) => Ok((partition as u32, offset as u64)),
            Err((err, _)) => Err(self.classify(err)),
        }
    }

    async fn join_group(&self, topic: &str, group: &str, member_id: &str) -> Result<Assignment, TransportError> {
        self.initialize_offsets(topic, group).await?;

        let mut config = self.group_config(group);
        config
            .set("client.id", member_id)
            .set("partition.assignment.strategy", "roundrobin");
        let consumer: StreamConsumer = config.create().map_err(|err| self.classify(err))?;
        consumer.subscribe(&[topic]).map_err(|err| self.classify(err))?;

        let member = Arc::new(GroupMember {
            topic: topic.to_string(),
            member_id: member_id.to_string(),
            consumer,
            state: Mutex::new(MemberState::default()),
        });
        let previous = self
            .members
            .lock()
            .map_err(|_| TransportError::Poisoned("kafka members"))?
            .insert((topic.to_string(), group.to_string()), Arc::clone(&member));
        if let Some(previous) = previous {
            blocking(move || previous.consumer.unsubscribe()).await?;
        }

        member.pump(REBALANCE_WAIT).await.map_err(|err| self.classify(err))?;
        member.assignment()
    }

    async fn assignment(&self, topic: &str, group: &str, _member_id: &str) -> Result<Assignment, TransportError> {
        let member = self.member(topic, group)?;
        // rebalances only progress while the consumer is polled
        member.pump(REBALANCE_WAIT).await.map_err(|err| self.classify(err))?;
        member.assignment()
    }

    async fn leave_group(&self, topic: &str, group: &str, _member_id: &str) -> Result<(), TransportError> {
        let removed = self
            .members
            .lock()
            .map_err(|_| TransportError::Poisoned("kafka members"))?
            .remove(&(topic.to_string(), group.to_string()));
        if let Some(member) = removed {
            // closing a consumer blocks until it has left the group
            blocking(move || {
                member.consumer.unsubscribe();
                drop(member);
            })
            .await?;
        }
        Ok(())
    }

    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        offset: u64,
        max_records: usize,
    ) -> Result<Vec<LogEntry>, TransportError> {
        let member = self.member(topic, group)?;

        let seek = {
            let mut state = member.state()?;
            let buffer = state.buffers.entry(partition).or_default();
            while buffer.front().is_some_and(|entry| entry.offset < offset) {
                buffer.pop_front();
            }
            let front = buffer.front().map(|entry| entry.offset);
            let behind = match front {
                Some(front) => front > offset,
                None => state.next.get(&partition).is_some_and(|next| *next > offset),
            };
            let seek = behind && state.sought.get(&partition) != Some(&offset);
            if seek {
                state.buffers.remove(&partition);
                state.next.insert(partition, offset);
                state.sought.insert(partition, offset);
            }
            seek
        };
        if seek {
            let seeker = Arc::clone(&member);
            let timeout = self.timeout;
            blocking(move || {
                seeker
                    .consumer
                    .seek(&seeker.topic, partition as i32, Offset::Offset(offset as i64), timeout)
            })
            .await?
            .map_err(|err| self.classify(err))?;
        }

        let empty = member.state()?.buffers.get(&partition).map_or(true, VecDeque::is_empty);
        if empty {
            member.pump(Duration::ZERO).await.map_err(|err| self.classify(err))?;
        }

        let mut state = member.state()?;
        let entries: Vec<LogEntry> = state
            .buffers
            .get(&partition)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|entry| entry.offset >= offset)
                    .take(max_records)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let drained = state.buffers.get(&partition).map_or(0, VecDeque::len) < BUFFER_LIMIT / 2;
        if drained && state.paused.remove(&partition) {
            let list = member.partitions([partition]).map_err(|err| self.classify(err))?;
            member.consumer.resume(&list).map_err(|err| self.classify(err))?;
        }
        Ok(entries)
    }

    async fn committed(&self, topic: &str, group: &str, partition: u32) -> Result<u64, TransportError> {
        let member = self.member(topic, group)?;
        let timeout = self.timeout;
        let offset = blocking(move || -> KafkaResult<u64> {
            let list = member.partitions([partition])?;
            let committed = member.consumer.committed_offsets(list, timeout)?;
            let stored = committed
                .elements_for_topic(&member.topic)
                .first()
                .and_then(|element| element.offset().to_raw())
                .filter(|offset| *offset >= 0);
            match stored {
                Some(offset) => Ok(offset as u64),
                None => {
                    let (_, high) = member.consumer.fetch_watermarks(&member.topic, partition as i32, timeout)?;
                    Ok(high.max(0) as u64)
                }
            }
        })
        .await?;
        offset.map_err(|err| self.classify(err))
    }

    async fn commit(&self, topic: &str, group: &str, partition: u32, offset: u64) -> Result<(), TransportError> {
        let member = self.member(topic, group)?;
        let result = blocking(move || -> KafkaResult<()> {
            let mut list = TopicPartitionList::new();
            list.add_partition_offset(&member.topic, partition as i32, Offset::Offset(offset as i64))?;
            member.consumer.commit(&list, CommitMode::Sync)
        })
        .await?;
        result.map_err(|err| self.classify(err))
    }
}

/// Errors that mean the cluster cannot be reached become connection errors
/// so the transport reconnects; everything else is a broker error.
fn classify(err: &KafkaError) -> TransportError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::AllBrokersDown)
        | Some(RDKafkaErrorCode::BrokerTransportFailure)
        | Some(RDKafkaErrorCode::Resolve) => TransportError::ConnectionLost,
        Some(RDKafkaErrorCode::Authentication) | Some(RDKafkaErrorCode::SaslAuthenticationFailed) => {
            TransportError::Connection(err.to_string())
        }
        _ => TransportError::Broker(err.to_string()),
    }
}
