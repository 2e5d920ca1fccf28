//! In-process store for tests and ephemeral servers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use tandem_core::{AcceptedOperation, DocumentId, Snapshot};

use super::{OperationStore, StoreError};

#[derive(Default)]
struct StoredDocument {
    operations: Vec<AcceptedOperation>,
    snapshot: Option<Snapshot>,
}

/// Memory-backed [`OperationStore`] with fault injection.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<DocumentId, StoredDocument>>,
    failing_appends: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail.
    pub fn fail_next_appends(&self, n: usize) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Fail every append until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of operations stored for a document.
    pub fn operation_count(&self, document_id: DocumentId) -> usize {
        self.lock()
            .map(|docs| docs.get(&document_id).map_or(0, |d| d.operations.len()))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<DocumentId, StoredDocument>>, StoreError> {
        self.documents
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn injected_failure(&self) -> bool {
        if self.unavailable.load(Ordering::SeqCst) {
            return true;
        }
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl OperationStore for MemoryStore {
    fn append(&self, document_id: DocumentId, accepted: &AcceptedOperation) -> Result<(), StoreError> {
        if self.injected_failure() {
            return Err(StoreError::Unavailable("injected append failure".into()));
        }
        let mut docs = self.lock()?;
        let doc = docs.entry(document_id).or_default();
        let expected = doc
            .operations
            .last()
            .map(|a| a.revision)
            .or(doc.snapshot.as_ref().map(|s| s.revision))
            .unwrap_or(0)
            + 1;
        if accepted.revision != expected {
            return Err(StoreError::RevisionConflict { expected, found: accepted.revision });
        }
        doc.operations.push(accepted.clone());
        Ok(())
    }

    fn read_from(&self, document_id: DocumentId, from_revision: u64) -> Result<Vec<AcceptedOperation>, StoreError> {
        let docs = self.lock()?;
        Ok(docs
            .get(&document_id)
            .map(|d| d.operations.iter().filter(|a| a.revision > from_revision).cloned().collect())
            .unwrap_or_default())
    }

    fn load_snapshot(&self, document_id: DocumentId) -> Result<Option<Snapshot>, StoreError> {
        let docs = self.lock()?;
        Ok(docs.get(&document_id).and_then(|d| d.snapshot.clone()))
    }

    fn save_snapshot(&self, document_id: DocumentId, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut docs = self.lock()?;
        docs.entry(document_id).or_default().snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        Ok(self.lock()?.keys().copied().collect())
    }
}
