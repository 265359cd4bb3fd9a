//! Peer sync wire protocol.
//!
//! Every frame on a data channel is one JSON message:
//! ```text
//! { "type": "sync-step-1" | "sync-step-2" | "update", "data": [<u8>, ...] }
//! ```
//! - `sync-step-1`: the sender's state vector
//! - `sync-step-2`: everything the receiver lacks relative to a state vector
//! - `update`: one incremental delta

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SyncMessage {
    #[serde(rename = "sync-step-1")]
    SyncStep1(Vec<u8>),
    #[serde(rename = "sync-step-2")]
    SyncStep2(Vec<u8>),
    #[serde(rename = "update")]
    Update(Vec<u8>),
}

impl SyncMessage {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::SyncStep1(_) => "sync-step-1",
            SyncMessage::SyncStep2(_) => "sync-step-2",
            SyncMessage::Update(_) => "update",
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            SyncMessage::SyncStep1(data)
            | SyncMessage::SyncStep2(data)
            | SyncMessage::Update(data) => data,
        }
    }

    /// Serialize to one wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    /// Parse one wire frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(frame).map_err(ProtocolError::Decode)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode sync message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed sync frame: {0}")]
    Decode(#[source] serde_json::Error),
}
