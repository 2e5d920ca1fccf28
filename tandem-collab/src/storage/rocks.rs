//! RocksDB-backed operation store.
//!
//! Column families:
//! - `operations`: accepted operations keyed by `doc_id:revision` (big-endian),
//!   value `checksum:u32 LE` followed by the bincode record
//! - `snapshots`: latest snapshot per document (LZ4 compressed)
//! - `metadata`: per-document counters and timestamps
//!
//! An append writes the operation and the updated metadata in one batch.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tandem_core::{AcceptedOperation, DocumentId, Snapshot};
use uuid::Uuid;

use super::{OperationStore, StoreError};

const CF_OPERATIONS: &str = "operations";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_OPERATIONS, CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: true; an acknowledged operation must
    /// survive a crash)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

/// Per-document bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentMetadata {
    pub document_id: DocumentId,
    /// Revision of the last appended operation
    pub revision: u64,
    pub operation_count: u64,
    /// Revision of the stored snapshot
    pub snapshot_revision: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: DocumentId) -> Self {
        let now = now_secs();
        Self {
            document_id,
            revision: 0,
            operation_count: 0,
            snapshot_revision: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed [`OperationStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes metadata read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened operation store at {}", config.path.display());

        Ok(Self { db, config, write_lock: Mutex::new(()) })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPERATIONS => {
                // Many small appends, range-scanned by document prefix.
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_SNAPSHOTS => {
                // Already LZ4 compressed in the value.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn load_metadata(&self, document_id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(document_id)),
        }
    }

    fn metadata_or_new(&self, document_id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        match self.load_metadata(document_id) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(DocumentMetadata::new(document_id)),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("store write lock poisoned".into()))
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl OperationStore for RocksStore {
    fn append(&self, document_id: DocumentId, accepted: &AcceptedOperation) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        let mut meta = self.metadata_or_new(document_id)?;
        let expected = meta.revision.max(meta.snapshot_revision) + 1;
        if accepted.revision != expected {
            return Err(StoreError::RevisionConflict { expected, found: accepted.revision });
        }

        let record = encode_record(accepted)?;
        meta.revision = accepted.revision;
        meta.operation_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_OPERATIONS)?, operation_key(document_id, accepted.revision), &record);
        batch.put_cf(self.cf(CF_METADATA)?, document_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!("Appended revision {} of {document_id}", accepted.revision);
        Ok(())
    }

    fn read_from(&self, document_id: DocumentId, from_revision: u64) -> Result<Vec<AcceptedOperation>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start_key = operation_key(document_id, from_revision.saturating_add(1));

        let mut operations = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != document_id.as_bytes() {
                break;
            }
            let mut rev_buf = [0u8; 8];
            rev_buf.copy_from_slice(&key[16..24]);
            let revision = u64::from_be_bytes(rev_buf);

            let accepted = decode_record(&value)
                .ok_or(StoreError::Corrupted { document_id, revision })??;
            operations.push(accepted);
        }

        Ok(operations)
    }

    fn load_snapshot(&self, document_id: DocumentId) -> Result<Option<Snapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(cf, document_id.as_bytes())? else {
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (snapshot, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Some(snapshot))
    }

    fn save_snapshot(&self, document_id: DocumentId, snapshot: &Snapshot) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        let bytes = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&bytes);

        let mut meta = self.metadata_or_new(document_id)?;
        meta.snapshot_revision = snapshot.revision;
        meta.snapshot_size = bytes.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SNAPSHOTS)?, document_id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, document_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key.len() == 16 {
                let bytes: [u8; 16] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?;
                ids.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(ids)
    }
}

/// `doc_id (16 bytes) ++ revision (8 bytes big-endian)`, so a forward scan
/// yields one document's operations in revision order.
fn operation_key(document_id: DocumentId, revision: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(document_id.as_bytes());
    key.extend_from_slice(&revision.to_be_bytes());
    key
}

fn encode_record(accepted: &AcceptedOperation) -> Result<Vec<u8>, StoreError> {
    let body = bincode::serde::encode_to_vec(accepted, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    let mut record = Vec::with_capacity(4 + body.len());
    record.extend_from_slice(&checksum(&body).to_le_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

/// `None` when the checksum does not match.
fn decode_record(record: &[u8]) -> Option<Result<AcceptedOperation, StoreError>> {
    if record.len() < 4 {
        return None;
    }
    let (sum, body) = record.split_at(4);
    let mut sum_buf = [0u8; 4];
    sum_buf.copy_from_slice(sum);
    if u32::from_le_bytes(sum_buf) != checksum(body) {
        return None;
    }
    Some(
        bincode::serde::decode_from_slice(body, bincode::config::standard())
            .map(|(accepted, _)| accepted)
            .map_err(|e| StoreError::DeserializationError(e.to_string())),
    )
}

/// FNV-1a over the record body.
fn checksum(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
