//! In-process edit log.
//!
//! Shared by cloning: every clone sees the same records. Appends are
//! validated as a whole before anything is inserted, so a rejected batch
//! leaves no trace. Each persisted record is also published on a local
//! change feed, which [`LocalPushChannel`] exposes as a push channel.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

use bimsync_core::{ModelId, OperationRecord, PersistedRecord, Timestamp};

use super::{
    next_timestamp, stamp, validate_batch, DeleteScope, EditLog, ModelMetadata, PersistenceError,
};
use crate::channel::LocalPushChannel;
use crate::protocol::ChangeEvent;

/// Change feed buffer per subscriber.
const FEED_CAPACITY: usize = 1024;

#[derive(Default)]
struct MemoryInner {
    records: HashMap<ModelId, Vec<PersistedRecord>>,
    op_ids: HashSet<Uuid>,
    models: BTreeMap<ModelId, (ModelMetadata, Vec<u8>)>,
    clock: Timestamp,
}

#[derive(Clone)]
pub struct MemoryEditLog {
    inner: Arc<Mutex<MemoryInner>>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryEditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEditLog {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            feed,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, PersistenceError> {
        self.inner
            .lock()
            .map_err(|_| PersistenceError::Database("memory log lock poisoned".into()))
    }

    /// Store a base model snapshot.
    pub fn save_model(
        &self,
        model_id: &ModelId,
        snapshot: Vec<u8>,
    ) -> Result<ModelMetadata, PersistenceError> {
        let mut inner = self.lock()?;
        let mut meta = match inner.models.remove(model_id) {
            Some((meta, _)) => meta,
            None => ModelMetadata::new(model_id.clone()),
        };
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = meta.snapshot_size;
        meta.updated_at = Timestamp::now().as_micros();
        inner.models.insert(model_id.clone(), (meta.clone(), snapshot));
        Ok(meta)
    }

    /// Number of records currently held for a model.
    pub fn record_count(&self, model_id: &ModelId) -> usize {
        self.lock()
            .map(|inner| inner.records.get(model_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// A push channel fed by this log's appends.
    pub fn push_channel(&self) -> LocalPushChannel {
        LocalPushChannel::new(self.feed.clone())
    }

    fn append_batch(
        &self,
        model_id: &ModelId,
        records: Vec<OperationRecord>,
    ) -> Result<Vec<PersistedRecord>, PersistenceError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let persisted = {
            let mut inner = self.lock()?;
            validate_batch(model_id, &records, |op_id| Ok(inner.op_ids.contains(op_id)))?;

            let created_at = next_timestamp(inner.clock);
            inner.clock = created_at;
            let persisted = stamp(records, created_at);
            inner.op_ids.extend(persisted.iter().map(PersistedRecord::op_id));
            inner
                .records
                .entry(model_id.clone())
                .or_default()
                .extend(persisted.iter().cloned());
            persisted
        };

        for record in &persisted {
            // No receivers is fine: nobody is listening yet.
            let _ = self.feed.send(ChangeEvent::insert(record.clone()));
        }
        Ok(persisted)
    }

    fn query_range(
        &self,
        model_id: &ModelId,
        after: Option<Timestamp>,
    ) -> Result<Vec<PersistedRecord>, PersistenceError> {
        let inner = self.lock()?;
        // Stored in append order, which is already canonical.
        Ok(inner
            .records
            .get(model_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| after.map_or(true, |after| r.created_at > after))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_records(
        &self,
        model_id: &ModelId,
        scope: DeleteScope,
    ) -> Result<usize, PersistenceError> {
        let mut inner = self.lock()?;
        let MemoryInner { records, op_ids, .. } = &mut *inner;
        let Some(model_records) = records.get_mut(model_id) else {
            return Ok(0);
        };

        let before = model_records.len();
        match scope {
            DeleteScope::Model => {
                for record in model_records.drain(..) {
                    op_ids.remove(&record.op_id());
                }
            }
            DeleteScope::Records(ids) => {
                let ids: HashSet<Uuid> = ids.into_iter().collect();
                model_records.retain(|record| {
                    let remove = ids.contains(&record.op_id());
                    if remove {
                        op_ids.remove(&record.op_id());
                    }
                    !remove
                });
            }
        }
        Ok(before - model_records.len())
    }
}

impl EditLog for MemoryEditLog {
    async fn append(
        &self,
        model_id: &ModelId,
        records: Vec<OperationRecord>,
    ) -> Result<Vec<PersistedRecord>, PersistenceError> {
        self.append_batch(model_id, records)
    }

    async fn query(
        &self,
        model_id: &ModelId,
        after: Option<Timestamp>,
    ) -> Result<Vec<PersistedRecord>, PersistenceError> {
        self.query_range(model_id, after)
    }

    async fn delete(
        &self,
        model_id: &ModelId,
        scope: DeleteScope,
    ) -> Result<usize, PersistenceError> {
        self.delete_records(model_id, scope)
    }

    async fn fetch_model(&self, model_id: &ModelId) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.lock()?.models.get(model_id).map(|(_, snapshot)| snapshot.clone()))
    }

    async fn store_model(
        &self,
        model_id: &ModelId,
        snapshot: Vec<u8>,
    ) -> Result<ModelMetadata, PersistenceError> {
        self.save_model(model_id, snapshot)
    }

    async fn model_catalog(&self) -> Result<Vec<ModelMetadata>, PersistenceError> {
        Ok(self.lock()?.models.values().map(|(meta, _)| meta.clone()).collect())
    }

    async fn remove_model(&self, model_id: &ModelId) -> Result<(), PersistenceError> {
        let removed = self.delete_records(model_id, DeleteScope::Model)?;
        self.lock()?.models.remove(model_id);
        log::info!("Deleted model {model_id} and {removed} records");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimsync_core::{AuthorId, EditOp, OperationEncoder};

    fn translations(model: &str, n: usize) -> Vec<OperationRecord> {
        OperationEncoder::new(ModelId::from(model), AuthorId::new("u1"))
            .normalize_all((0..n).map(|_| EditOp::translate("wall-12", [1.0, 0.0, 0.0])).collect())
    }

    #[tokio::test]
    async fn test_append_and_query() {
        let log = MemoryEditLog::new();
        let model = ModelId::from("m");

        let a = log.append(&model, translations("m", 2)).await.unwrap();
        let b = log.append(&model, translations("m", 1)).await.unwrap();
        assert!(b[0].created_at > a[1].created_at);
        assert_eq!(a[1].sequence_order, 1);

        assert_eq!(log.query(&model, None).await.unwrap().len(), 3);
        assert_eq!(log.query(&model, Some(a[0].created_at)).await.unwrap(), b);
        assert!(log.query(&ModelId::from("other"), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_batch_leaves_no_trace() {
        let log = MemoryEditLog::new();
        let model = ModelId::from("m");

        let existing = log.append(&model, translations("m", 1)).await.unwrap();
        let mut batch = translations("m", 2);
        batch.push(existing[0].record.clone());

        let err = log.append(&model, batch.clone()).await.unwrap_err();
        assert_eq!(err, PersistenceError::DuplicateOp(existing[0].op_id()));
        assert_eq!(log.record_count(&model), 1);

        // The fresh records in the rejected batch were not reserved.
        batch.pop();
        assert_eq!(log.append(&model, batch).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_scopes() {
        let log = MemoryEditLog::new();
        let model = ModelId::from("m");

        let persisted = log.append(&model, translations("m", 3)).await.unwrap();
        let removed = log
            .delete(&model, DeleteScope::Records(vec![persisted[0].op_id()]))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(log.delete(&model, DeleteScope::Model).await.unwrap(), 2);
        assert_eq!(log.record_count(&model), 0);
    }

    #[tokio::test]
    async fn test_change_feed_publishes_inserts() {
        let log = MemoryEditLog::new();
        let mut feed = log.feed.subscribe();
        let model = ModelId::from("m");

        let persisted = log.append(&model, translations("m", 2)).await.unwrap();
        for expected in persisted {
            let event = feed.recv().await.unwrap();
            assert_eq!(event, ChangeEvent::insert(expected));
        }
    }

    #[tokio::test]
    async fn test_model_library() {
        let log = MemoryEditLog::new();
        let model = ModelId::from("m");
        assert_eq!(log.fetch_model(&model).await.unwrap(), None);

        log.save_model(&model, b"{\"elements\":[]}".to_vec()).unwrap();
        assert!(log.fetch_model(&model).await.unwrap().is_some());

        let meta = log.store_model(&ModelId::from("a"), vec![0; 8]).await.unwrap();
        assert_eq!(meta.snapshot_size, 8);
        let ids: Vec<String> = log
            .model_catalog()
            .await
            .unwrap()
            .into_iter()
            .map(|meta| meta.model_id.to_string())
            .collect();
        assert_eq!(ids, ["a", "m"]);

        log.append(&model, translations("m", 2)).await.unwrap();
        log.remove_model(&model).await.unwrap();
        assert_eq!(log.fetch_model(&model).await.unwrap(), None);
        assert_eq!(log.record_count(&model), 0);
    }
}
