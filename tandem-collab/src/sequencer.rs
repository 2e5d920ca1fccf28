//! Per-document operation sequencer.
//!
//! ```text
//!            prepare(op)                 commit(accepted)
//!   Idle ───────────────► Processing(id) ────────────────► Idle
//!     ▲                        │
//!     └──────── abort() ───────┘   (durable append failed)
//! ```
//!
//! `prepare` never touches the document or the log; it only computes the
//! accepted form of a submission. The caller persists that record and then
//! commits it. Callers serialize access (the registry holds the sequencer
//! behind an async mutex), so at most one submission is in `Processing`.

use std::collections::HashMap;

use tandem_core::{
    transform, AcceptedOperation, Document, DocumentId, OpId, Operation, OperationError, Snapshot,
};

use crate::protocol::RejectReason;
use crate::storage::{OperationStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Processing(OpId),
}

/// Result of sequencing one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequenced {
    /// Newly ordered at the carried revision.
    Accepted(AcceptedOperation),
    /// Already ordered earlier; the original record, nothing appended.
    Duplicate(AcceptedOperation),
}

impl Sequenced {
    pub fn accepted(&self) -> &AcceptedOperation {
        match self {
            Sequenced::Accepted(a) | Sequenced::Duplicate(a) => a,
        }
    }
}

/// Why a submission was not accepted.
#[derive(Debug, Clone)]
pub enum SubmitError {
    /// Base revision is ahead of the document, or older than the retained log
    Stale { base_revision: u64, current_revision: u64 },
    /// Does not fit the document after transformation
    InvalidRange(OperationError),
    /// Another submission is between prepare and commit
    Busy(OpId),
    /// Durable append failed
    Unavailable(StoreError),
    /// Session token or author not recognised
    UnknownSession,
}

impl SubmitError {
    /// Wire form of the error.
    pub fn reason(&self) -> RejectReason {
        match self {
            SubmitError::Stale { .. } => RejectReason::StaleSubmission,
            SubmitError::InvalidRange(_) => RejectReason::InvalidRange,
            SubmitError::Busy(_) | SubmitError::Unavailable(_) => RejectReason::SequencerUnavailable,
            SubmitError::UnknownSession => RejectReason::UnknownSession,
        }
    }
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Stale { base_revision, current_revision } => {
                write!(f, "Stale submission: base {base_revision}, document at {current_revision}")
            }
            SubmitError::InvalidRange(e) => write!(f, "Invalid range: {e}"),
            SubmitError::Busy(id) => write!(f, "Sequencer busy with {id}"),
            SubmitError::Unavailable(e) => write!(f, "Sequencer unavailable: {e}"),
            SubmitError::UnknownSession => write!(f, "Unknown session"),
        }
    }
}

impl std::error::Error for SubmitError {}

impl From<OperationError> for SubmitError {
    fn from(e: OperationError) -> Self {
        SubmitError::InvalidRange(e)
    }
}

impl From<StoreError> for SubmitError {
    fn from(e: StoreError) -> Self {
        SubmitError::Unavailable(e)
    }
}

/// Authoritative state and accepted log of one document.
pub struct Sequencer {
    document: Document,
    /// Accepted operations with revisions `log_start + 1 ..= revision`
    log: Vec<AcceptedOperation>,
    log_start: u64,
    /// OpId → revision it was accepted at
    seen: HashMap<OpId, u64>,
    state: SequencerState,
}

impl Sequencer {
    /// Empty document at revision 0.
    pub fn new(document_id: DocumentId) -> Self {
        Self::from_snapshot(&Snapshot::empty(document_id))
    }

    /// Start from a snapshot with no retained history before it.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            document: Document::from_snapshot(snapshot),
            log: Vec::new(),
            log_start: snapshot.revision,
            seen: HashMap::new(),
            state: SequencerState::Idle,
        }
    }

    /// Rebuild from the store: latest snapshot, then the accepted log.
    ///
    /// Operations at or below the snapshot revision only repopulate the log
    /// (for duplicate detection and transforms); later ones are applied.
    pub fn recover(document_id: DocumentId, store: &dyn OperationStore) -> Result<Self, StoreError> {
        let snapshot = store.load_snapshot(document_id)?.unwrap_or_else(|| Snapshot::empty(document_id));
        let operations = store.read_from(document_id, 0)?;

        let mut sequencer = Self::from_snapshot(&snapshot);
        if let Some(first) = operations.first() {
            let start = first.revision.saturating_sub(1);
            if start > snapshot.revision {
                return Err(StoreError::Corrupted { document_id, revision: first.revision });
            }
            sequencer.log_start = start;
        }

        for accepted in operations {
            let expected = sequencer.log_start + sequencer.log.len() as u64 + 1;
            if accepted.revision != expected {
                return Err(StoreError::Corrupted { document_id, revision: accepted.revision });
            }
            if accepted.revision > snapshot.revision {
                sequencer
                    .document
                    .commit(&accepted)
                    .map_err(|_| StoreError::Corrupted { document_id, revision: accepted.revision })?;
            }
            sequencer.seen.insert(accepted.op.id, accepted.revision);
            sequencer.log.push(accepted);
        }

        log::info!(
            "Recovered document {document_id} at revision {} ({} logged operations)",
            sequencer.revision(),
            sequencer.log.len()
        );
        Ok(sequencer)
    }

    /// Compute the accepted form of `op`, authored against `op.base_revision`.
    pub fn prepare(&mut self, op: Operation) -> Result<Sequenced, SubmitError> {
        if let SequencerState::Processing(id) = self.state {
            return Err(SubmitError::Busy(id));
        }
        if let Some(original) = self.find(op.id) {
            return Ok(Sequenced::Duplicate(original.clone()));
        }
        if op.document_id != self.document.id() {
            return Err(SubmitError::InvalidRange(OperationError::DocumentMismatch {
                expected: self.document.id(),
                found: op.document_id,
            }));
        }

        let current = self.revision();
        let base = op.base_revision;
        if base > current || base < self.log_start {
            return Err(SubmitError::Stale { base_revision: base, current_revision: current });
        }

        let concurrent = &self.log[(base - self.log_start) as usize..];
        let rebased = concurrent
            .iter()
            .fold(op, |op, accepted| transform(&op, &accepted.op))
            .with_base_revision(current);
        rebased.validate(self.document.len_chars())?;

        self.state = SequencerState::Processing(rebased.id);
        Ok(Sequenced::Accepted(AcceptedOperation { op: rebased, revision: current + 1 }))
    }

    /// Apply a prepared operation after it was persisted.
    pub fn commit(&mut self, accepted: AcceptedOperation) -> Result<(), SubmitError> {
        match self.state {
            SequencerState::Processing(id) if id == accepted.op.id => {}
            _ => return Err(SubmitError::Busy(accepted.op.id)),
        }
        self.document.commit(&accepted)?;
        self.state = SequencerState::Idle;
        self.seen.insert(accepted.op.id, accepted.revision);
        self.log.push(accepted);
        Ok(())
    }

    /// Drop a prepared operation; nothing was changed.
    pub fn abort(&mut self) {
        self.state = SequencerState::Idle;
    }

    /// Prepare, append and commit in one go (no retries).
    pub fn submit(&mut self, op: Operation, store: &dyn OperationStore) -> Result<Sequenced, SubmitError> {
        let sequenced = self.prepare(op)?;
        if let Sequenced::Accepted(accepted) = &sequenced {
            if let Err(e) = store.append(self.document.id(), accepted) {
                self.abort();
                return Err(e.into());
            }
            self.commit(accepted.clone())?;
        }
        Ok(sequenced)
    }

    /// Accepted operations after `revision`, or `None` when that revision is
    /// outside the retained log.
    pub fn accepted_since(&self, revision: u64) -> Option<Vec<AcceptedOperation>> {
        if revision < self.log_start || revision > self.revision() {
            return None;
        }
        Some(self.log[(revision - self.log_start) as usize..].to_vec())
    }

    fn find(&self, id: OpId) -> Option<&AcceptedOperation> {
        let revision = *self.seen.get(&id)?;
        self.log.get((revision - self.log_start - 1) as usize)
    }

    pub fn document_id(&self) -> DocumentId {
        self.document.id()
    }

    pub fn revision(&self) -> u64 {
        self.document.revision()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn snapshot(&self) -> Snapshot {
        self.document.snapshot()
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }
}
