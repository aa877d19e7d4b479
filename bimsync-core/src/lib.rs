//! Core types for synchronizing edits on shared BIM models.
//!
//! This crate is transport- and storage-agnostic:
//!
//! - [`record`]: operation records and their canonical ordering
//! - [`normalize`]: encoding local edits and repairing degraded payloads
//! - [`model`]: the geometry engine boundary plus an in-memory [`SceneModel`]
//! - [`replay`]: idempotent, ordered application of records
//! - [`selection`]: the select / edit / apply state machine of one session
//!
//! Networking, persistence and change notification live in `bimsync-collab`.

pub mod model;
pub mod normalize;
pub mod record;
pub mod replay;
pub mod selection;

pub use model::{
    Element, Geometry, GeometryEngine, ModelHandle, ModelLoadError, ReplayError, SceneEngine,
    SceneModel, SceneSnapshot,
};
pub use normalize::{
    normalize_batch, normalize_payload, normalize_persisted, MalformedField, OperationEncoder,
};
pub use record::{
    sort_canonical, AuthorId, EditOp, ElementId, ModelId, OpKind, OperationRecord, PersistedRecord,
    Timestamp,
};
pub use replay::{ReplayEngine, ReplayReport};
pub use selection::{ReselectPolicy, Selection, SelectionMachine};
