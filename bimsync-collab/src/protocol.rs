//! Binary protocol between sessions and the log service.
//!
//! Wire format (bincode-encoded envelope, one per binary WebSocket frame):
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────┐
//! │ msg_type │ request_id │ model_id │ payload  │
//! │ 1 byte   │ varint     │ string   │ variable │
//! └──────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! Record payloads inside the envelope are JSON text, the same form the log
//! stores. Requests carry a `request_id` that the matching response echoes;
//! pushed `Event` messages use request id 0.

use bimsync_core::{ModelId, PersistedRecord, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message types for the log protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Start receiving change events for a model
    Subscribe = 1,
    /// Subscription acknowledged
    Subscribed = 2,
    /// One change event pushed to subscribers
    Event = 3,
    /// Append a batch of operation records
    Append = 4,
    /// Records persisted, with store-assigned ordering
    Appended = 5,
    /// Range query: records created after a timestamp
    Query = 6,
    QueryResult = 7,
    /// Maintenance delete
    Delete = 8,
    Deleted = 9,
    /// Request the base snapshot of a model
    FetchModel = 10,
    ModelData = 11,
    /// Request failed; payload is a UTF-8 message
    Error = 12,
    Ping = 13,
    Pong = 14,
    /// Add or replace a base snapshot; payload is the raw snapshot
    SaveModel = 15,
    ModelSaved = 16,
    /// List the model library
    ListModels = 17,
    ModelList = 18,
    /// Remove a model's snapshot and edit history
    DeleteModel = 19,
    ModelDeleted = 20,
}

/// Kind of change carried by an [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One change to a model's log, as pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: PersistedRecord,
}

impl ChangeEvent {
    pub fn insert(record: PersistedRecord) -> Self {
        Self {
            kind: ChangeKind::Insert,
            record,
        }
    }
}

/// Body of a [`MessageType::Query`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Exclusive lower bound; `None` returns the full history
    pub after: Option<Timestamp>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_type: MessageType,
    /// Correlates a response with its request
    pub request_id: u64,
    pub model_id: ModelId,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn new(
        msg_type: MessageType,
        request_id: u64,
        model_id: ModelId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            request_id,
            model_id,
            payload,
        }
    }

    /// Build a message whose payload is the JSON encoding of `body`.
    pub fn with_json<T: Serialize>(
        msg_type: MessageType,
        request_id: u64,
        model_id: ModelId,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(msg_type, request_id, model_id, payload))
    }

    pub fn subscribe(request_id: u64, model_id: ModelId) -> Self {
        Self::new(MessageType::Subscribe, request_id, model_id, Vec::new())
    }

    pub fn subscribed(request_id: u64, model_id: ModelId) -> Self {
        Self::new(MessageType::Subscribed, request_id, model_id, Vec::new())
    }

    pub fn event(model_id: ModelId, event: &ChangeEvent) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Event, 0, model_id, event)
    }

    pub fn query(
        request_id: u64,
        model_id: ModelId,
        after: Option<Timestamp>,
    ) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Query, request_id, model_id, &QueryRequest { after })
    }

    pub fn fetch_model(request_id: u64, model_id: ModelId) -> Self {
        Self::new(MessageType::FetchModel, request_id, model_id, Vec::new())
    }

    /// Snapshot response; `None` when the library has no such model.
    pub fn model_data(
        request_id: u64,
        model_id: ModelId,
        snapshot: Option<Vec<u8>>,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::ModelData, request_id, model_id, payload))
    }

    pub fn save_model(request_id: u64, model_id: ModelId, snapshot: Vec<u8>) -> Self {
        Self::new(MessageType::SaveModel, request_id, model_id, snapshot)
    }

    pub fn list_models(request_id: u64) -> Self {
        Self::new(MessageType::ListModels, request_id, ModelId::new(""), Vec::new())
    }

    pub fn delete_model(request_id: u64, model_id: ModelId) -> Self {
        Self::new(MessageType::DeleteModel, request_id, model_id, Vec::new())
    }

    pub fn error(request_id: u64, model_id: ModelId, message: impl Into<String>) -> Self {
        Self::new(MessageType::Error, request_id, model_id, message.into().into_bytes())
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, 0, ModelId::new(""), Vec::new())
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong, 0, ModelId::new(""), Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Decode the JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse the payload of a [`MessageType::ModelData`] response.
    pub fn snapshot(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.expect(MessageType::ModelData)?;
        let (snapshot, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(snapshot)
    }

    /// Text of a [`MessageType::Error`] response.
    pub fn error_message(&self) -> Option<String> {
        (self.msg_type == MessageType::Error)
            .then(|| String::from_utf8_lossy(&self.payload).into_owned())
    }

    /// Fail unless this message has the given type.
    pub fn expect(&self, expected: MessageType) -> Result<&Self, ProtocolError> {
        if self.msg_type == expected {
            Ok(self)
        } else if let Some(message) = self.error_message() {
            Err(ProtocolError::Remote(message))
        } else {
            Err(ProtocolError::UnexpectedMessage {
                expected,
                found: self.msg_type,
            })
        }
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?}, received {found:?}")]
    UnexpectedMessage {
        expected: MessageType,
        found: MessageType,
    },
    #[error("remote error: {0}")]
    Remote(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
