use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Remembers topics known to exist so publishes skip the broker round trip.
///
/// Only positive answers are cached; a missing topic is checked again on
/// every call.
pub(crate) struct TopicCache {
    ttl: Duration,
    known: DashMap<String, Instant>,
}

impl TopicCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            known: DashMap::new(),
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        let fresh = self.known.get(topic).map(|seen| seen.elapsed() < self.ttl);
        match fresh {
            Some(true) => true,
            Some(false) => {
                self.known.remove(topic);
                false
            }
            None => false,
        }
    }

    pub fn insert(&self, topic: &str) {
        self.known.insert(topic.to_string(), Instant::now());
    }

    /// Forget everything, e.g. after reconnecting to a broker that may have
    /// lost state.
    pub fn clear(&self) {
        self.known.clear();
    }
}
