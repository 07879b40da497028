use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from encoding or decoding an event payload.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("json payload error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bitcode payload error: {0}")]
    Bitcode(#[from] bitcode::Error),
}

/// Wire format of outbox payloads.
///
/// Producers and consumers of a topic must agree on the format; JSON is the
/// default because it stays readable in the outbox and dead-letter tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    #[default]
    Json,
    Bitcode,
}

impl PayloadFormat {
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, SerializationError> {
        match self {
            PayloadFormat::Json => Ok(serde_json::to_vec(value)?),
            PayloadFormat::Bitcode => Ok(bitcode::serialize(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, SerializationError> {
        match self {
            PayloadFormat::Json => Ok(serde_json::from_slice(bytes)?),
            PayloadFormat::Bitcode => Ok(bitcode::deserialize(bytes)?),
        }
    }
}
