//! RocksDB-backed edit log and base model library.
//!
//! Column families:
//! - `records`  — Persisted records as JSON, keyed by `<model><created_at><seq>`
//! - `op_index` — `op_id` → record key, for duplicate rejection and targeted deletes
//! - `models`   — Base model snapshots (LZ4 compressed), keyed by model id
//! - `metadata` — Model metadata (bincode) and the store clock
//!
//! Record keys sort by model, then `created_at`, then `sequence_order`, so a
//! forward scan from `<model><after + 1>` yields a range query in canonical
//! order. Each append is one `WriteBatch`: the whole batch lands or none of it.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bimsync_core::{ModelId, OperationRecord, PersistedRecord, Timestamp};

use super::{next_timestamp, stamp, validate_batch, DeleteScope, EditLog, PersistenceError};

/// Column family names.
const CF_RECORDS: &str = "records";
const CF_OP_INDEX: &str = "op_index";
const CF_MODELS: &str = "models";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_OP_INDEX, CF_MODELS, CF_METADATA];

const CLOCK_KEY: &[u8] = b"clock";
const MODEL_META_PREFIX: &[u8] = b"model/";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every append (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("bimsync_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Library entry for one base model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_id: ModelId,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Microseconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl ModelMetadata {
    pub(crate) fn new(model_id: ModelId) -> Self {
        let now = Timestamp::now().as_micros();
        Self {
            model_id,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable edit log.
pub struct RocksEditLog {
    /// Column families are fixed at open, so single-threaded mode suffices
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes appends; holds the last assigned `created_at`
    clock: Mutex<Timestamp>,
}

impl RocksEditLog {
    /// Open the log at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let clock = Self::recover_clock(&db)?;
        log::info!("Opened edit log at {} (clock {})", config.path.display(), clock.0);

        Ok(Self {
            db,
            config,
            clock: Mutex::new(clock),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_RECORDS => {
                // Many small appends, range-scanned per model
                opts.set_max_write_buffer_number(4);
            }
            CF_MODELS => {
                // Already LZ4 compressed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OP_INDEX | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn recover_clock(db: &DBWithThreadMode<SingleThreaded>) -> Result<Timestamp, PersistenceError> {
        let cf = db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| {
                PersistenceError::Database(format!("Column family '{CF_METADATA}' not found"))
            })?;
        Ok(match db.get_cf(&cf, CLOCK_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Timestamp(u64::from_be_bytes(buf))
            }
            _ => Timestamp::ZERO,
        })
    }

    // ─── Edit log ─────────────────────────────────────────────────────

    /// Persist a batch atomically.
    pub fn append_batch(
        &self,
        model_id: &ModelId,
        records: Vec<OperationRecord>,
    ) -> Result<Vec<PersistedRecord>, PersistenceError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let cf_records = self.cf(CF_RECORDS)?;
        let cf_index = self.cf(CF_OP_INDEX)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut clock = self
            .clock
            .lock()
            .map_err(|_| PersistenceError::Database("append lock poisoned".into()))?;

        validate_batch(model_id, &records, |op_id| {
            Ok(self.db.get_cf(&cf_index, op_id.as_bytes())?.is_some())
        })?;

        let created_at = next_timestamp(*clock);
        let persisted = stamp(records, created_at);

        let mut batch = WriteBatch::default();
        for record in &persisted {
            let key = record_key(model_id, record.created_at, record.sequence_order);
            batch.put_cf(&cf_records, &key, record.to_json()?);
            batch.put_cf(&cf_index, record.op_id().as_bytes(), &key);
        }
        batch.put_cf(&cf_meta, CLOCK_KEY, created_at.0.to_be_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        *clock = created_at;

        log::debug!("Appended {} records to {model_id} at {}", persisted.len(), created_at.0);
        Ok(persisted)
    }

    /// Records of a model created after `after`, in canonical order.
    pub fn query_range(
        &self,
        model_id: &ModelId,
        after: Option<Timestamp>,
    ) -> Result<Vec<PersistedRecord>, PersistenceError> {
        let cf = self.cf(CF_RECORDS)?;
        let prefix = model_prefix(model_id);
        let from = after.map_or(0, |t| t.0.saturating_add(1));

        let mut start = prefix.clone();
        start.extend_from_slice(&from.to_be_bytes());

        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            records.push(PersistedRecord::from_json(&value)?);
        }
        Ok(records)
    }

    /// Remove records of a model. Returns how many were removed.
    pub fn delete_records(
        &self,
        model_id: &ModelId,
        scope: &DeleteScope,
    ) -> Result<usize, PersistenceError> {
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_index = self.cf(CF_OP_INDEX)?;
        let prefix = model_prefix(model_id);

        let mut batch = WriteBatch::default();
        let mut count = 0;

        match scope {
            DeleteScope::Model => {
                let iter = self
                    .db
                    .iterator_cf(&cf_records, IteratorMode::From(&prefix, Direction::Forward));
                for item in iter {
                    let (key, value) = item?;
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    let record = PersistedRecord::from_json(&value)?;
                    batch.delete_cf(&cf_records, &key);
                    batch.delete_cf(&cf_index, record.op_id().as_bytes());
                    count += 1;
                }
            }
            DeleteScope::Records(op_ids) => {
                for op_id in op_ids {
                    if let Some(key) = self.db.get_cf(&cf_index, op_id.as_bytes())? {
                        // Ignore identities that belong to another model.
                        if key.starts_with(&prefix) {
                            batch.delete_cf(&cf_records, &key);
                            batch.delete_cf(&cf_index, op_id.as_bytes());
                            count += 1;
                        }
                    }
                }
            }
        }

        if count > 0 {
            self.db.write(batch)?;
            log::info!("Deleted {count} records of {model_id}");
        }
        Ok(count)
    }

    // ─── Model library ────────────────────────────────────────────────

    /// Store a base model snapshot (LZ4 compressed).
    pub fn save_model(
        &self,
        model_id: &ModelId,
        snapshot: &[u8],
    ) -> Result<ModelMetadata, PersistenceError> {
        let cf_models = self.cf(CF_MODELS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = match self.load_metadata(model_id) {
            Ok(meta) => meta,
            Err(PersistenceError::NotFound(_)) => ModelMetadata::new(model_id.clone()),
            Err(e) => return Err(e),
        };
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = Timestamp::now().as_micros();

        // Atomic batch write: snapshot + metadata
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_models, model_id.as_str().as_bytes(), &compressed);
        batch.put_cf(&cf_meta, metadata_key(model_id), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::info!(
            "Saved model {model_id} ({} bytes, {} compressed)",
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Load a base model snapshot (LZ4 decompressed).
    pub fn load_model(&self, model_id: &ModelId) -> Result<Vec<u8>, PersistenceError> {
        let cf = self.cf(CF_MODELS)?;
        match self.db.get_cf(&cf, model_id.as_str().as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| PersistenceError::Compression(e.to_string())),
            None => Err(PersistenceError::NotFound(model_id.clone())),
        }
    }

    pub fn model_exists(&self, model_id: &ModelId) -> Result<bool, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, metadata_key(model_id))?.is_some())
    }

    pub fn load_metadata(&self, model_id: &ModelId) -> Result<ModelMetadata, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, metadata_key(model_id))? {
            Some(bytes) => ModelMetadata::decode(&bytes),
            None => Err(PersistenceError::NotFound(model_id.clone())),
        }
    }

    /// All models in the library, ordered by id.
    pub fn list_models(&self) -> Result<Vec<ModelMetadata>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        let mut models = Vec::new();

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(MODEL_META_PREFIX, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(MODEL_META_PREFIX) {
                break;
            }
            models.push(ModelMetadata::decode(&value)?);
        }
        Ok(models)
    }

    /// Delete a model's snapshot, metadata and whole edit history.
    pub fn delete_model(&self, model_id: &ModelId) -> Result<(), PersistenceError> {
        let removed = self.delete_records(model_id, &DeleteScope::Model)?;

        let cf_models = self.cf(CF_MODELS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_models, model_id.as_str().as_bytes());
        batch.delete_cf(&cf_meta, metadata_key(model_id));
        self.db.write(batch)?;

        log::info!("Deleted model {model_id} and {removed} records");
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    /// Last assigned `created_at`.
    pub fn clock(&self) -> Timestamp {
        self.clock.lock().map(|c| *c).unwrap_or(Timestamp::ZERO)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Database(format!("Column family '{name}' not found")))
    }
}

impl EditLog for RocksEditLog {
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
        self.delete_records(model_id, &scope)
    }

    async fn fetch_model(&self, model_id: &ModelId) -> Result<Option<Vec<u8>>, PersistenceError> {
        match self.load_model(model_id) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(PersistenceError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn store_model(
        &self,
        model_id: &ModelId,
        snapshot: Vec<u8>,
    ) -> Result<ModelMetadata, PersistenceError> {
        self.save_model(model_id, &snapshot)
    }

    async fn model_catalog(&self) -> Result<Vec<ModelMetadata>, PersistenceError> {
        self.list_models()
    }

    async fn remove_model(&self, model_id: &ModelId) -> Result<(), PersistenceError> {
        self.delete_model(model_id)
    }
}

/// Length-prefixed model id, so no model's prefix is another's.
fn model_prefix(model_id: &ModelId) -> Vec<u8> {
    let id = model_id.as_str().as_bytes();
    let mut key = Vec::with_capacity(4 + id.len() + 12);
    key.extend_from_slice(&(id.len() as u32).to_be_bytes());
    key.extend_from_slice(id);
    key
}

/// `<model prefix><created_at: 8 bytes BE><sequence_order: 4 bytes BE>`
fn record_key(model_id: &ModelId, created_at: Timestamp, sequence_order: u32) -> Vec<u8> {
    let mut key = model_prefix(model_id);
    key.extend_from_slice(&created_at.0.to_be_bytes());
    key.extend_from_slice(&sequence_order.to_be_bytes());
    key
}

fn metadata_key(model_id: &ModelId) -> Vec<u8> {
    let mut key = MODEL_META_PREFIX.to_vec();
    key.extend_from_slice(model_id.as_str().as_bytes());
    key
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
