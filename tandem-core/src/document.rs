use ropey::Rope;
use serde::{Deserialize, Serialize};

use crate::operation::{AcceptedOperation, DocumentId, Operation, OperationError};

/// Point-in-time copy of a document, as handed to joining participants and
/// written to the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub document_id: DocumentId,
    pub content: String,
    pub revision: u64,
}

impl Snapshot {
    pub fn empty(document_id: DocumentId) -> Self {
        Self { document_id, content: String::new(), revision: 0 }
    }
}

/// A plain-text document at a known revision.
#[derive(Debug, Clone)]
pub struct Document {
    id: DocumentId,
    content: Rope,
    revision: u64,
}

impl Document {
    pub fn new(id: DocumentId) -> Self {
        Self { id, content: Rope::new(), revision: 0 }
    }

    pub fn from_text(id: DocumentId, text: &str, revision: u64) -> Self {
        Self { id, content: Rope::from_str(text), revision }
    }

    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self::from_text(snapshot.document_id, &snapshot.content, snapshot.revision)
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn content(&self) -> &Rope {
        &self.content
    }

    pub fn text(&self) -> String {
        self.content.to_string()
    }

    pub fn len_chars(&self) -> usize {
        self.content.len_chars()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot { document_id: self.id, content: self.text(), revision: self.revision }
    }

    /// Text in `[start, end)`, clamped to the document.
    pub fn slice(&self, start: usize, end: usize) -> String {
        let len = self.len_chars();
        let end = end.min(len);
        let start = start.min(end);
        self.content.slice(start..end).to_string()
    }

    /// Document with `op` applied. The revision is unchanged; ordering is
    /// the caller's business (see [`Document::commit`]).
    pub fn apply(&self, op: &Operation) -> Result<Document, OperationError> {
        let mut next = self.clone();
        next.apply_in_place(op)?;
        Ok(next)
    }

    pub fn apply_in_place(&mut self, op: &Operation) -> Result<(), OperationError> {
        if op.document_id != self.id {
            return Err(OperationError::DocumentMismatch { expected: self.id, found: op.document_id });
        }
        op.apply_to(&mut self.content)
    }

    /// Apply an ordered operation and advance to its revision.
    pub fn commit(&mut self, accepted: &AcceptedOperation) -> Result<(), OperationError> {
        let expected = self.revision + 1;
        if accepted.revision != expected {
            log::warn!("Document {} expected revision {expected}, got {}", self.id, accepted.revision);
            return Err(OperationError::RevisionGap { expected, found: accepted.revision });
        }
        if let Err(e) = self.apply_in_place(&accepted.op) {
            log::error!("Revision {} of document {} does not apply: {e}", accepted.revision, self.id);
            return Err(e);
        }
        self.revision = accepted.revision;
        Ok(())
    }

    /// Zero-based `(line, column)` of a character offset, for display only.
    pub fn line_col(&self, offset: usize) -> Option<(usize, usize)> {
        if offset > self.len_chars() {
            return None;
        }
        let line = self.content.char_to_line(offset);
        let column = offset - self.content.line_to_char(line);
        Some((line, column))
    }

    /// Inverse of [`Document::line_col`]. Columns past the end of a line are
    /// rejected.
    pub fn offset_of(&self, line: usize, column: usize) -> Option<usize> {
        if line >= self.content.len_lines() {
            return None;
        }
        let start = self.content.line_to_char(line);
        let line_len = self.content.line(line).len_chars();
        if column > line_len {
            return None;
        }
        Some(start + column)
    }
}

/// Pure application: `document` with `op` applied.
pub fn apply(document: &Document, op: &Operation) -> Result<Document, OperationError> {
    document.apply(op)
}
