//! WebSocket log service: the shared edit log behind a binary protocol.
//!
//! Architecture:
//! ```text
//! Session A ──┐ Append / Query / Delete / FetchModel
//!             ├──────────────► LogServer ── EditLog (RocksDB)
//! Session B ──┘                   │
//!                                 │ Event (insert) per appended record
//!                          RoomManager (model_id → BroadcastGroup)
//!                          ┌──────┼───────┐
//!                          ▼      ▼       ▼
//!                       Subscribed connections of that model
//! ```
//!
//! A connection may issue any number of requests and subscribe to one model
//! at a time. Appended records are broadcast to subscribers only after the
//! log accepted them, so an event never precedes durability.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use bimsync_core::{ModelId, OperationRecord};

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::protocol::{ChangeEvent, MessageType, QueryRequest, WireMessage};
use crate::storage::{
    DeleteScope, EditLog, MemoryEditLog, PersistenceError, RocksEditLog, StoreConfig,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per model
    pub broadcast_capacity: usize,
    /// RocksDB directory (None = default `StoreConfig` path)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `BIMSYNC_BIND_ADDR`, `BIMSYNC_DATA_DIR` and
    /// `BIMSYNC_BROADCAST_CAPACITY`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("BIMSYNC_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(dir) = std::env::var("BIMSYNC_DATA_DIR") {
            config.storage_path = Some(PathBuf::from(dir));
        }
        if let Ok(capacity) = std::env::var("BIMSYNC_BROADCAST_CAPACITY") {
            match capacity.parse() {
                Ok(capacity) if capacity > 0 => config.broadcast_capacity = capacity,
                _ => log::warn!("Ignoring invalid BIMSYNC_BROADCAST_CAPACITY={capacity}"),
            }
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub appended_records: u64,
    pub failed_requests: u64,
}

/// Shared state handed to every connection task.
struct Shared<L> {
    log: Arc<L>,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl<L> Clone for Shared<L> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            room_manager: self.room_manager.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// The log service.
pub struct LogServer<L: EditLog> {
    config: ServerConfig,
    shared: Shared<L>,
}

impl LogServer<RocksEditLog> {
    /// Open the durable log configured by `storage_path`.
    pub fn open(config: ServerConfig) -> Result<Self, PersistenceError> {
        let store_config = match &config.storage_path {
            Some(path) => StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            },
            None => StoreConfig::default(),
        };
        let log = RocksEditLog::open(store_config)?;
        Ok(Self::new(config, log))
    }
}

impl LogServer<MemoryEditLog> {
    /// Non-durable server, for tests and demos.
    pub fn in_memory(config: ServerConfig) -> Self {
        Self::new(config, MemoryEditLog::new())
    }
}

impl<L: EditLog> LogServer<L> {
    pub fn new(config: ServerConfig, log: L) -> Self {
        let room_manager = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            shared: Shared {
                log: Arc::new(log),
                room_manager,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Log server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn log(&self) -> &Arc<L> {
        &self.shared.log
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.shared.room_manager
    }
}

/// Subscription held by one connection.
struct ActiveSubscription {
    room: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

async fn handle_connection<L: EditLog>(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Shared<L>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let conn_id = Uuid::new_v4();

    log::info!("WebSocket connection {conn_id} established from {addr}");
    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut subscription: Option<ActiveSubscription> = None;

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = shared.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let request = match WireMessage::decode(&data) {
                            Ok(request) => request,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };

                        let reply = match request.msg_type {
                            MessageType::Subscribe => {
                                if let Some(previous) = subscription.take() {
                                    leave(&shared, previous, conn_id).await;
                                }
                                let room =
                                    shared.room_manager.get_or_create(&request.model_id).await;
                                let rx = room.add_subscriber(conn_id, addr).await;
                                subscription = Some(ActiveSubscription { room, rx });
                                log::info!(
                                    "Connection {conn_id} subscribed to model {}",
                                    request.model_id
                                );
                                WireMessage::subscribed(request.request_id, request.model_id)
                            }
                            MessageType::Ping => {
                                let mut pong = WireMessage::pong();
                                pong.request_id = request.request_id;
                                pong
                            }
                            _ => respond(&shared, request).await,
                        };
                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {conn_id} closed from {addr}");
                        break;
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    Some(Ok(_)) => {}
                },

                event = async {
                    match subscription.as_mut() {
                        Some(sub) => sub.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match event {
                    Ok(data) => {
                        ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Close so the subscriber reconnects and catches up by query.
                        log::warn!("Connection {conn_id} lagged by {n} events; closing");
                        if let Some(sub) = &subscription {
                            sub.room.record_dropped(n);
                        }
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
    .await;

    if let Some(sub) = subscription.take() {
        leave(&shared, sub, conn_id).await;
    }
    {
        let mut s = shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    result
}

async fn leave<L>(shared: &Shared<L>, sub: ActiveSubscription, conn_id: Uuid) {
    let model_id = sub.room.model_id().clone();
    sub.room.remove_subscriber(&conn_id).await;
    drop(sub);
    if shared.room_manager.remove_if_empty(&model_id).await {
        log::debug!("Room {model_id} removed (empty)");
    }
}

/// Serve one log request. Failures become `Error` replies.
async fn respond<L: EditLog>(shared: &Shared<L>, request: WireMessage) -> WireMessage {
    let request_id = request.request_id;
    let model_id = request.model_id.clone();
    match execute(shared, request).await {
        Ok(reply) => reply,
        Err(e) => {
            log::error!("Request {request_id} for model {model_id} failed: {e}");
            shared.stats.write().await.failed_requests += 1;
            WireMessage::error(request_id, model_id, e.to_string())
        }
    }
}

async fn execute<L: EditLog>(
    shared: &Shared<L>,
    request: WireMessage,
) -> Result<WireMessage, PersistenceError> {
    let WireMessage {
        msg_type,
        request_id,
        model_id,
        ..
    } = request.clone();

    match msg_type {
        MessageType::Append => {
            let records: Vec<OperationRecord> = request.json()?;
            let persisted = shared.log.append(&model_id, records).await?;
            shared.stats.write().await.appended_records += persisted.len() as u64;

            let reply = WireMessage::with_json(
                MessageType::Appended,
                request_id,
                model_id.clone(),
                &persisted,
            )?;
            if let Some(room) = shared.room_manager.get(&model_id).await {
                for record in persisted {
                    if let Err(e) = room.publish(&ChangeEvent::insert(record)) {
                        log::warn!("Failed to broadcast event for model {model_id}: {e}");
                    }
                }
            }
            Ok(reply)
        }
        MessageType::Query => {
            let QueryRequest { after } = request.json()?;
            let records = shared.log.query(&model_id, after).await?;
            log::debug!("Query for {model_id} after {after:?}: {} records", records.len());
            Ok(WireMessage::with_json(MessageType::QueryResult, request_id, model_id, &records)?)
        }
        MessageType::Delete => {
            let scope: DeleteScope = request.json()?;
            let removed = shared.log.delete(&model_id, scope).await?;
            log::info!("Deleted {removed} records of model {model_id}");
            Ok(WireMessage::with_json(MessageType::Deleted, request_id, model_id, &removed)?)
        }
        MessageType::FetchModel => {
            let snapshot = shared.log.fetch_model(&model_id).await?;
            Ok(WireMessage::model_data(request_id, model_id, snapshot)?)
        }
        MessageType::SaveModel => {
            let meta = shared.log.store_model(&model_id, request.payload).await?;
            log::info!("Stored model {model_id} ({} bytes)", meta.snapshot_size);
            Ok(WireMessage::with_json(MessageType::ModelSaved, request_id, model_id, &meta)?)
        }
        MessageType::ListModels => {
            let models = shared.log.model_catalog().await?;
            Ok(WireMessage::with_json(MessageType::ModelList, request_id, model_id, &models)?)
        }
        MessageType::DeleteModel => {
            shared.log.remove_model(&model_id).await?;
            Ok(WireMessage::new(MessageType::ModelDeleted, request_id, model_id, Vec::new()))
        }
        other => Err(PersistenceError::Rejected(format!("unsupported request {other:?}"))),
    }
}
