use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A message as seen by transports and handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Producer-assigned id; the outbox dispatcher uses the event id.
    pub id: String,
    /// Set by the transport on publish.
    #[serde(default)]
    pub topic: String,
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// 1 on first delivery; counted by the broker where it can.
    #[serde(default)]
    pub delivery_attempt: u32,
}

impl Message {
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            topic: String::new(),
            payload,
            metadata: HashMap::new(),
            delivery_attempt: 0,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
