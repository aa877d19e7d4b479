//! # bimsync-collab — Edit log, change notification and sessions
//!
//! Keeps every session of a shared model converged on the same ordered
//! sequence of edit operations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  append / query   ┌──────────────────┐
//! │ SessionController│ ────────────────► │ EditLog          │
//! │ (per user)       │                   │ (RocksDB, remote)│
//! └────────┬─────────┘                   └────────┬─────────┘
//!          │ queued batches                       │ insert events
//!          │                                      ▼
//! ┌────────┴─────────┐   push / poll     ┌──────────────────┐
//! │ ChangeNotifier   │ ◄──────────────── │ LogServer        │
//! │ (watermark)      │                   │ + RoomManager    │
//! └──────────────────┘                   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode envelope, JSON records)
//! - [`storage`] — The `EditLog` trait and its RocksDB, in-memory and remote backends
//! - [`channel`] — Push channels delivering change events
//! - [`notifier`] — Push with reconnect backoff and polling fallback
//! - [`session`] — Session lifecycle, selection editing and history
//! - [`broadcast`] — Per-model fan-out on the server
//! - [`server`] — WebSocket log service

pub mod broadcast;
pub mod channel;
pub mod history;
pub mod notifier;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use channel::{ChannelError, LocalPushChannel, PushChannel, Subscription, WsPushChannel};
pub use history::{display_author, history_entries, AuthorColor, HistoryEntry};
pub use notifier::{
    ChangeNotifier, DeliveryMode, NotifierConfig, SharedWatermark, SubscriptionHandle, Watermark,
};
pub use protocol::{ChangeEvent, ChangeKind, MessageType, ProtocolError, QueryRequest, WireMessage};
pub use server::{LogServer, ServerConfig, ServerStats};
pub use session::{SessionConfig, SessionController, SessionError, SessionState};
pub use storage::{
    DeleteScope, EditLog, MemoryEditLog, ModelMetadata, PersistenceError, RemoteEditLog,
    RocksEditLog, StoreConfig,
};
