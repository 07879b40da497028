use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::client::{Assignment, LogClient, LogConnector, LogEntry, LogRecord};
use crate::transport::{ConnectionParams, TransportError};

struct TopicLog {
    partitions: Vec<Vec<LogRecord>>,
    next_partition: u32,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
            next_partition: 0,
        }
    }

    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn partition_for(&mut self, key: Option<&str>) -> u32 {
        let count = self.partition_count();
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % u64::from(count)) as u32
            }
            None => {
                let partition = self.next_partition % count;
                self.next_partition = self.next_partition.wrapping_add(1);
                partition
            }
        }
    }
}

struct Group {
    offsets: Vec<u64>,
    members: BTreeSet<String>,
    generation: u64,
}

impl Group {
    /// Partition `p` goes to the member at index `p % members`.
    fn assignment(&self, member_id: &str) -> Option<Assignment> {
        let index = self.members.iter().position(|member| member == member_id)?;
        let members = self.members.len();
        let partitions = (0..self.offsets.len() as u32)
            .filter(|partition| *partition as usize % members == index)
            .collect();
        Some(Assignment {
            generation: self.generation,
            partitions,
        })
    }
}

#[derive(Default)]
struct BrokerState {
    epoch: u64,
    unreachable: bool,
    credentials: Option<(String, String)>,
    connections: usize,
    topics: HashMap<String, TopicLog>,
    groups: HashMap<(String, String), Group>,
    /// Members joined per connection epoch, dropped when it is severed.
    sessions: HashMap<(String, String, String), u64>,
}

/// Partitioned log held in memory.
///
/// Offsets are committed per group and survive members leaving. Severing
/// connections evicts every member, which rebalances the groups.
#[derive(Clone, Default)]
pub struct MemoryLogBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryLogBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.credentials = Some((username.into(), password.into()));
        }
        self
    }

    pub fn sever_connections(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.epoch += 1;
        let BrokerState { groups, sessions, .. } = &mut *state;
        for ((topic, group, member), _) in sessions.drain() {
            if let Some(group) = groups.get_mut(&(topic, group)) {
                if group.members.remove(&member) {
                    group.generation += 1;
                }
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

    pub fn has_group(&self, topic: &str, group: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.groups.contains_key(&(topic.to_string(), group.to_string())))
            .unwrap_or(false)
    }

    /// Records the group has not committed yet.
    pub fn lag(&self, topic: &str, group: &str) -> u64 {
        let Ok(state) = self.state.lock() else {
            return 0;
        };
        let (Some(log), Some(group)) = (
            state.topics.get(topic),
            state.groups.get(&(topic.to_string(), group.to_string())),
        ) else {
            return 0;
        };
        log.partitions
            .iter()
            .zip(&group.offsets)
            .map(|(partition, committed)| (partition.len() as u64).saturating_sub(*committed))
            .sum()
    }

    pub fn member_count(&self, topic: &str, group: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|state| {
                state
                    .groups
                    .get(&(topic.to_string(), group.to_string()))
                    .map(|group| group.members.len())
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl LogConnector for MemoryLogBroker {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn LogClient>, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Poisoned("log broker"))?;
        if state.unreachable {
            return Err(TransportError::Connection(format!("{}: no brokers available", params.address)));
        }
        if let Some((username, password)) = &state.credentials {
            let supplied = (params.username.as_deref(), params.password.as_deref());
            if supplied != (Some(username.as_str()), Some(password.as_str())) {
                return Err(TransportError::Connection("SASL authentication failed".into()));
            }
        }
        state.connections += 1;
        Ok(Arc::new(MemoryLogClient {
            state: Arc::clone(&self.state),
            epoch: state.epoch,
        }))
    }
}

struct MemoryLogClient {
    state: Arc<Mutex<BrokerState>>,
    epoch: u64,
}

fn unknown_topic(topic: &str) -> TransportError {
    TransportError::Broker(format!("UNKNOWN_TOPIC_OR_PARTITION - {topic}"))
}

fn unknown_group(topic: &str, group: &str) -> TransportError {
    TransportError::Broker(format!("GROUP_ID_NOT_FOUND - {group} on {topic}"))
}

impl MemoryLogClient {
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        let state = self
            .state
            .lock()
            .map_err(|_| TransportError::Poisoned("log broker"))?;
        if state.epoch != self.epoch {
            return Err(TransportError::ConnectionLost);
        }
        Ok(state)
    }
}

#[async_trait]
impl LogClient for MemoryLogClient {
    fn is_open(&self) -> bool {
        self.state().is_ok()
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError> {
        Ok(self.state()?.topics.contains_key(topic))
    }

    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), TransportError> {
        self.state()?
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(partitions));
        Ok(())
    }

    async fn produce(&self, topic: &str, record: LogRecord) -> Result<(u32, u64), TransportError> {
        let mut state = self.state()?;
        let log = state.topics.get_mut(topic).ok_or_else(|| unknown_topic(topic))?;
        let partition = log.partition_for(record.key.as_deref());
        let records = &mut log.partitions[partition as usize];
        records.push(record);
        Ok((partition, records.len() as u64 - 1))
    }

    async fn join_group(&self, topic: &str, group: &str, member_id: &str) -> Result<Assignment, TransportError> {
        let mut state = self.state()?;
        let epoch = state.epoch;
        let ends: Vec<u64> = state
            .topics
            .get(topic)
            .ok_or_else(|| unknown_topic(topic))?
            .partitions
            .iter()
            .map(|records| records.len() as u64)
            .collect();

        let key = (topic.to_string(), group.to_string());
        let entry = state.groups.entry(key).or_insert_with(|| Group {
            offsets: ends,
            members: BTreeSet::new(),
            generation: 0,
        });
        if entry.members.insert(member_id.to_string()) {
            entry.generation += 1;
        }
        let assignment = entry.assignment(member_id);
        state
            .sessions
            .insert((topic.to_string(), group.to_string(), member_id.to_string()), epoch);
        assignment.ok_or_else(|| unknown_group(topic, group))
    }

    async fn assignment(&self, topic: &str, group: &str, member_id: &str) -> Result<Assignment, TransportError> {
        let state = self.state()?;
        let entry = state
            .groups
            .get(&(topic.to_string(), group.to_string()))
            .ok_or_else(|| unknown_group(topic, group))?;
        entry
            .assignment(member_id)
            .ok_or_else(|| TransportError::Broker(format!("UNKNOWN_MEMBER_ID - {member_id}")))
    }

    async fn leave_group(&self, topic: &str, group: &str, member_id: &str) -> Result<(), TransportError> {
        let mut state = self.state()?;
        state
            .sessions
            .remove(&(topic.to_string(), group.to_string(), member_id.to_string()));
        if let Some(entry) = state.groups.get_mut(&(topic.to_string(), group.to_string())) {
            if entry.members.remove(member_id) {
                entry.generation += 1;
            }
        }
        Ok(())
    }

    async fn fetch(
        &self,
        topic: &str,
        _group: &str,
        partition: u32,
        offset: u64,
        max_records: usize,
    ) -> Result<Vec<LogEntry>, TransportError> {
        let state = self.state()?;
        let records = state
            .topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize))
            .ok_or_else(|| unknown_topic(topic))?;
        let start = (offset as usize).min(records.len());
        let end = start.saturating_add(max_records).min(records.len());
        Ok(records[start..end]
            .iter()
            .enumerate()
            .map(|(index, record)| LogEntry {
                partition,
                offset: (start + index) as u64,
                record: record.clone(),
            })
            .collect())
    }

    async fn committed(&self, topic: &str, group: &str, partition: u32) -> Result<u64, TransportError> {
        let state = self.state()?;
        state
            .groups
            .get(&(topic.to_string(), group.to_string()))
            .and_then(|entry| entry.offsets.get(partition as usize).copied())
            .ok_or_else(|| unknown_group(topic, group))
    }

    async fn commit(&self, topic: &str, group: &str, partition: u32, offset: u64) -> Result<(), TransportError> {
        let mut state = self.state()?;
        let slot = state
            .groups
            .get_mut(&(topic.to_string(), group.to_string()))
            .and_then(|entry| entry.offsets.get_mut(partition as usize))
            .ok_or_else(|| unknown_group(topic, group))?;
        *slot = offset;
        Ok(())
    }
}
