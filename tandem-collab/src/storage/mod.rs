//! Durable operation store.
//!
//! ```text
//! ┌────────────┐  append(accepted)   ┌───────────────┐
//! │ Sequencer  │ ──────────────────► │ OperationStore│
//! │ (per doc)  │ ◄────────────────── │               │
//! └────────────┘  snapshot + replay  └───────┬───────┘
//!                                    ┌───────┴───────┐
//!                               MemoryStore      RocksStore
//!                            (tests, ephemeral)  (column families)
//! ```
//!
//! The engine only relies on the narrow [`OperationStore`] trait; calls are
//! synchronous and expected to be short.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

use tandem_core::{AcceptedOperation, DocumentId, Snapshot};
use uuid::Uuid;

/// Append-only log of accepted operations plus snapshots.
pub trait OperationStore: Send + Sync {
    /// Persist the next accepted operation of `document_id`. Revisions must
    /// arrive contiguously.
    fn append(&self, document_id: DocumentId, accepted: &AcceptedOperation) -> Result<(), StoreError>;

    /// Accepted operations with revision greater than `from_revision`, in
    /// revision order.
    fn read_from(&self, document_id: DocumentId, from_revision: u64) -> Result<Vec<AcceptedOperation>, StoreError>;

    fn load_snapshot(&self, document_id: DocumentId) -> Result<Option<Snapshot>, StoreError>;

    fn save_snapshot(&self, document_id: DocumentId, snapshot: &Snapshot) -> Result<(), StoreError>;

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Stored record does not match its checksum
    Corrupted { document_id: Uuid, revision: u64 },
    /// Append out of revision order
    RevisionConflict { expected: u64, found: u64 },
    /// Store cannot take writes right now
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Corrupted { document_id, revision } => {
                write!(f, "Checksum mismatch for {document_id} at revision {revision}")
            }
            StoreError::RevisionConflict { expected, found } => {
                write!(f, "Out-of-order append: expected revision {expected}, got {found}")
            }
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
