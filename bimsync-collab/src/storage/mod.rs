//! Append-only edit log.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  append / query  ┌───────────────┐
//! │ Session     │ ───────────────► │ EditLog       │
//! │ Controller  │                  ├───────────────┤
//! └─────────────┘                  │ RocksEditLog  │ durable, owns the model library
//!                                  │ MemoryEditLog │ in-process, with a local change feed
//!                                  │ RemoteEditLog │ client of the log service
//!                                  └───────────────┘
//! ```
//!
//! Every backend assigns `created_at` strictly increasing per store and
//! `sequence_order` by position in the appended batch. Records are never
//! mutated after append. Backends do not retry failed writes.

pub mod memory;
pub mod remote;
pub mod rocks;

use std::future::Future;

use bimsync_core::{ModelId, OperationRecord, PersistedRecord, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryEditLog;
pub use remote::RemoteEditLog;
pub use rocks::{ModelMetadata, RocksEditLog, StoreConfig};

/// Storage failure or constraint violation. Returned to the caller, never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("record for model {found} appended to model {expected}")]
    ModelMismatch { expected: ModelId, found: ModelId },
    #[error("operation {0} already persisted")]
    DuplicateOp(Uuid),
    #[error("model not found: {0}")]
    NotFound(ModelId),
    #[error("log service unavailable: {0}")]
    Unavailable(String),
    #[error("log service rejected request: {0}")]
    Rejected(String),
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Serialization(e.to_string())
    }
}

/// What a maintenance delete removes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteScope {
    /// The model's whole edit history
    Model,
    /// Only the records with these identities
    Records(Vec<Uuid>),
}

/// Durable, ordered store of operation records keyed by model.
pub trait EditLog: Send + Sync + 'static {
    /// Persist a batch in order and return it with store-assigned ordering.
    fn append(
        &self,
        model_id: &ModelId,
        records: Vec<OperationRecord>,
    ) -> impl Future<Output = Result<Vec<PersistedRecord>, PersistenceError>> + Send;

    /// Records with `created_at > after`, ascending. `None` returns the full history.
    fn query(
        &self,
        model_id: &ModelId,
        after: Option<Timestamp>,
    ) -> impl Future<Output = Result<Vec<PersistedRecord>, PersistenceError>> + Send;

    /// Maintenance delete. Returns the number of records removed.
    fn delete(
        &self,
        model_id: &ModelId,
        scope: DeleteScope,
    ) -> impl Future<Output = Result<usize, PersistenceError>> + Send;

    /// Base snapshot of a model, if this backend keeps a model library.
    fn fetch_model(
        &self,
        model_id: &ModelId,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, PersistenceError>> + Send {
        let _ = model_id;
        async { Ok(None) }
    }

    /// Add or replace a base snapshot in the model library.
    fn store_model(
        &self,
        model_id: &ModelId,
        snapshot: Vec<u8>,
    ) -> impl Future<Output = Result<ModelMetadata, PersistenceError>> + Send {
        let _ = (model_id, snapshot);
        async { Err(PersistenceError::Rejected("backend has no model library".into())) }
    }

    /// Every model in the library, ordered by id.
    fn model_catalog(
        &self,
    ) -> impl Future<Output = Result<Vec<ModelMetadata>, PersistenceError>> + Send {
        async { Ok(Vec::new()) }
    }

    /// Remove a model's snapshot together with its edit history.
    fn remove_model(
        &self,
        model_id: &ModelId,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send {
        let _ = model_id;
        async { Err(PersistenceError::Rejected("backend has no model library".into())) }
    }
}

/// Reject records that belong to another model or repeat an identity.
pub(crate) fn validate_batch(
    model_id: &ModelId,
    records: &[OperationRecord],
    mut is_known: impl FnMut(&Uuid) -> Result<bool, PersistenceError>,
) -> Result<(), PersistenceError> {
    let mut batch_ids = std::collections::HashSet::with_capacity(records.len());
    for record in records {
        if &record.model_id != model_id {
            return Err(PersistenceError::ModelMismatch {
                expected: model_id.clone(),
                found: record.model_id.clone(),
            });
        }
        if !batch_ids.insert(record.op_id) || is_known(&record.op_id)? {
            return Err(PersistenceError::DuplicateOp(record.op_id));
        }
    }
    Ok(())
}

/// Next store timestamp: wall clock, forced strictly past the previous one.
pub(crate) fn next_timestamp(last: Timestamp) -> Timestamp {
    Timestamp::now().max(Timestamp(last.0.saturating_add(1)))
}

/// Attach store-assigned ordering to a validated batch.
pub(crate) fn stamp(records: Vec<OperationRecord>, created_at: Timestamp) -> Vec<PersistedRecord> {
    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| PersistedRecord {
            record,
            sequence_order: i as u32,
            created_at,
        })
        .collect()
}
