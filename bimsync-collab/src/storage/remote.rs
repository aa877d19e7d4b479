//! Edit log client of the log service.
//!
//! One WebSocket connection, opened lazily and reused; requests are
//! serialized over it and matched to replies by request id. A transport
//! failure drops the connection and fails the request; the next request
//! reconnects. Nothing is retried.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use bimsync_core::{ModelId, OperationRecord, PersistedRecord, Timestamp};

use super::{DeleteScope, EditLog, ModelMetadata, PersistenceError};
use crate::protocol::{MessageType, ProtocolError, WireMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

impl From<ProtocolError> for PersistenceError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Remote(message) => PersistenceError::Rejected(message),
            ProtocolError::Serialization(e) | ProtocolError::Deserialization(e) => {
                PersistenceError::Serialization(e)
            }
            other => PersistenceError::Unavailable(other.to_string()),
        }
    }
}

pub struct RemoteEditLog {
    url: String,
    request_timeout: Duration,
    conn: Mutex<Option<WsStream>>,
    next_request: AtomicU64,
}

impl RemoteEditLog {
    /// `url` is the log service endpoint, e.g. `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, Duration::from_secs(10))
    }

    pub fn with_timeout(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            request_timeout,
            conn: Mutex::new(None),
            next_request: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(&self, msg: WireMessage) -> Result<WireMessage, PersistenceError> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
            log::debug!("Connected to log service at {}", self.url);
            *conn = Some(ws_stream);
        }
        let Some(ws) = conn.as_mut() else {
            return Err(PersistenceError::Unavailable("not connected".into()));
        };

        match tokio::time::timeout(self.request_timeout, exchange(ws, msg)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                *conn = None;
                Err(e)
            }
            Err(_) => {
                *conn = None;
                Err(ProtocolError::Timeout.into())
            }
        }
    }
}

/// Send one request and wait for the reply carrying its id.
async fn exchange(ws: &mut WsStream, msg: WireMessage) -> Result<WireMessage, PersistenceError> {
    let request_id = msg.request_id;
    ws.send(Message::Binary(msg.encode()?.into()))
        .await
        .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;

    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Binary(data)) => {
                let reply = WireMessage::decode(&data)?;
                match reply.msg_type {
                    MessageType::Ping => {
                        let pong = WireMessage::pong().encode()?;
                        let _ = ws.send(Message::Binary(pong.into())).await;
                    }
                    MessageType::Event => {}
                    _ if reply.request_id == request_id => return Ok(reply),
                    other => log::debug!("Ignoring stale {other:?} reply {}", reply.request_id),
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => return Err(PersistenceError::Unavailable(e.to_string())),
        }
    }
    Err(ProtocolError::ConnectionClosed.into())
}

impl EditLog for RemoteEditLog {
    async fn append(
        &self,
        model_id: &ModelId,
        records: Vec<OperationRecord>,
    ) -> Result<Vec<PersistedRecord>, PersistenceError> {
        let msg = WireMessage::with_json(
            MessageType::Append,
            self.request_id(),
            model_id.clone(),
            &records,
        )?;
        let reply = self.request(msg).await?;
        Ok(reply.expect(MessageType::Appended)?.json()?)
    }

    async fn query(
        &self,
        model_id: &ModelId,
        after: Option<Timestamp>,
    ) -> Result<Vec<PersistedRecord>, PersistenceError> {
        let msg = WireMessage::query(self.request_id(), model_id.clone(), after)?;
        let reply = self.request(msg).await?;
        Ok(reply.expect(MessageType::QueryResult)?.json()?)
    }

    async fn delete(
        &self,
        model_id: &ModelId,
        scope: DeleteScope,
    ) -> Result<usize, PersistenceError> {
        let msg = WireMessage::with_json(
            MessageType::Delete,
            self.request_id(),
            model_id.clone(),
            &scope,
        )?;
        let reply = self.request(msg).await?;
        Ok(reply.expect(MessageType::Deleted)?.json()?)
    }

    async fn fetch_model(&self, model_id: &ModelId) -> Result<Option<Vec<u8>>, PersistenceError> {
        let msg = WireMessage::fetch_model(self.request_id(), model_id.clone());
        let reply = self.request(msg).await?;
        Ok(reply.snapshot()?)
    }

    async fn store_model(
        &self,
        model_id: &ModelId,
        snapshot: Vec<u8>,
    ) -> Result<ModelMetadata, PersistenceError> {
        let msg = WireMessage::save_model(self.request_id(), model_id.clone(), snapshot);
        let reply = self.request(msg).await?;
        Ok(reply.expect(MessageType::ModelSaved)?.json()?)
    }

    async fn model_catalog(&self) -> Result<Vec<ModelMetadata>, PersistenceError> {
        let reply = self.request(WireMessage::list_models(self.request_id())).await?;
        Ok(reply.expect(MessageType::ModelList)?.json()?)
    }

    async fn remove_model(&self, model_id: &ModelId) -> Result<(), PersistenceError> {
        let msg = WireMessage::delete_model(self.request_id(), model_id.clone());
        self.request(msg).await?.expect(MessageType::ModelDeleted)?;
        Ok(())
    }
}
