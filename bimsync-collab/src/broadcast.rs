//! Per-model fan-out of change events to subscribed connections.
//!
//! Each model gets one tokio broadcast channel; every subscribed
//! connection holds an independent receiver buffering up to `capacity`
//! encoded messages. A receiver that falls further behind lags and drops
//! events; its notifier recovers them with a catch-up query.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use bimsync_core::ModelId;

use crate::protocol::{ChangeEvent, ProtocolError, WireMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters for the send path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Subscribers of one model.
pub struct BroadcastGroup {
    model_id: ModelId,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Connection id → remote address
    subscribers: RwLock<HashMap<Uuid, SocketAddr>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(model_id: ModelId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            model_id,
            sender,
            subscribers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    /// Register a connection and return its receiver.
    pub async fn add_subscriber(
        &self,
        conn_id: Uuid,
        addr: SocketAddr,
    ) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.subscribers.write().await.insert(conn_id, addr);
        self.sender.subscribe()
    }

    pub async fn remove_subscriber(&self, conn_id: &Uuid) -> Option<SocketAddr> {
        self.subscribers.write().await.remove(conn_id)
    }

    /// Encode once and send to every subscriber. Returns the receiver count.
    pub fn publish(&self, event: &ChangeEvent) -> Result<usize, ProtocolError> {
        let encoded = WireMessage::event(self.model_id.clone(), event)?.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Send pre-encoded bytes to every subscriber.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn has_subscriber(&self, conn_id: &Uuid) -> bool {
        self.subscribers.read().await.contains_key(conn_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps model ids to their broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<ModelId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room of a model.
    pub async fn get_or_create(&self, model_id: &ModelId) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        if let Some(room) = self.rooms.read().await.get(model_id) {
            return room.clone();
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(model_id.clone())
            .or_insert_with(|| {
                Arc::new(BroadcastGroup::new(model_id.clone(), self.default_capacity))
            })
            .clone()
    }

    /// Existing room of a model, if anyone ever subscribed.
    pub async fn get(&self, model_id: &ModelId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(model_id).cloned()
    }

    /// Remove a room with no subscribers left.
    pub async fn remove_if_empty(&self, model_id: &ModelId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(model_id) {
            if room.subscriber_count().await == 0 {
                rooms.remove(model_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_models(&self) -> Vec<ModelId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
