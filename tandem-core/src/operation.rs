//! Wire-level edit representation.
//!
//! An [`Operation`] is a short sequence of [`Component`]s applied left to
//! right, each one addressing the document state left behind by the
//! previous component. Freshly authored edits carry exactly one component;
//! transformation and composition may produce more.
//!
//! All positions are absolute character offsets (Unicode scalar values),
//! never byte offsets or line/column pairs.

use ropey::Rope;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Participant identity as supplied by the identity provider.
pub type ParticipantId = Uuid;

/// Stable document identifier.
pub type DocumentId = Uuid;

/// Globally unique operation identifier.
///
/// Ordered lexicographically: author first, then the author's sequence
/// number. The ordering breaks ties between concurrent inserts at the same
/// offset, so it must be total and independent of arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub author: ParticipantId,
    pub seq: u64,
}

impl OpId {
    pub fn new(author: ParticipantId, seq: u64) -> Self {
        Self { author, seq }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.author, self.seq)
    }
}

/// A primitive edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    /// Insert `content` before the character at `position`.
    Insert { position: usize, content: String },
    /// Remove `length` characters starting at `position`.
    Delete { position: usize, length: usize },
}

impl Component {
    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Component::Insert { position, content: content.into() }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Component::Delete { position, length }
    }

    pub fn position(&self) -> usize {
        match self {
            Component::Insert { position, .. } | Component::Delete { position, .. } => *position,
        }
    }

    /// Number of characters inserted or removed.
    pub fn span(&self) -> usize {
        match self {
            Component::Insert { content, .. } => content.chars().count(),
            Component::Delete { length, .. } => *length,
        }
    }

    /// Empty inserts and zero-length deletes change nothing.
    pub fn is_noop(&self) -> bool {
        match self {
            Component::Insert { content, .. } => content.is_empty(),
            Component::Delete { length, .. } => *length == 0,
        }
    }

    pub(crate) fn with_position(&self, position: usize) -> Self {
        match self {
            Component::Insert { content, .. } => Component::Insert { position, content: content.clone() },
            Component::Delete { length, .. } => Component::Delete { position, length: *length },
        }
    }

    /// Check the component against a document of `len` characters and
    /// return the length afterwards.
    fn apply_len(&self, len: usize) -> Result<usize, OperationError> {
        match self {
            Component::Insert { position, content } => {
                if *position > len {
                    return Err(OperationError::OutOfBounds { position: *position, length: 0, document_len: len });
                }
                Ok(len + content.chars().count())
            }
            Component::Delete { position, length } => match position.checked_add(*length) {
                Some(end) if end <= len => Ok(len - length),
                _ => Err(OperationError::OutOfBounds { position: *position, length: *length, document_len: len }),
            },
        }
    }
}

/// A participant's edit against a known revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub document_id: DocumentId,
    /// Revision of the document the edit was authored against.
    pub base_revision: u64,
    pub components: Vec<Component>,
}

impl Operation {
    pub fn new(id: OpId, document_id: DocumentId, base_revision: u64, components: Vec<Component>) -> Self {
        Self {
            id,
            document_id,
            base_revision,
            components: components.into_iter().filter(|c| !c.is_noop()).collect(),
        }
    }

    pub fn insert(id: OpId, document_id: DocumentId, base_revision: u64, position: usize, content: impl Into<String>) -> Self {
        Self::new(id, document_id, base_revision, vec![Component::insert(position, content)])
    }

    pub fn delete(id: OpId, document_id: DocumentId, base_revision: u64, position: usize, length: usize) -> Self {
        Self::new(id, document_id, base_revision, vec![Component::delete(position, length)])
    }

    /// Replace `length` characters at `position` with `content`.
    pub fn replace(
        id: OpId,
        document_id: DocumentId,
        base_revision: u64,
        position: usize,
        length: usize,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            document_id,
            base_revision,
            vec![Component::delete(position, length), Component::insert(position, content)],
        )
    }

    pub fn author(&self) -> ParticipantId {
        self.id.author
    }

    pub fn is_noop(&self) -> bool {
        self.components.iter().all(Component::is_noop)
    }

    /// Same edit with different components; identity and base are kept.
    pub fn with_components(&self, components: Vec<Component>) -> Self {
        Self::new(self.id, self.document_id, self.base_revision, components)
    }

    pub fn with_base_revision(mut self, base_revision: u64) -> Self {
        self.base_revision = base_revision;
        self
    }

    /// Total characters removed.
    pub fn deleted_len(&self) -> usize {
        self.components
            .iter()
            .filter_map(|c| match c {
                Component::Delete { length, .. } => Some(*length),
                _ => None,
            })
            .sum()
    }

    /// Concatenation of all inserted text, in application order.
    pub fn inserted_text(&self) -> String {
        self.components
            .iter()
            .filter_map(|c| match c {
                Component::Insert { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Validate against a document of `len` characters, returning the length
    /// after application.
    pub fn validate(&self, len: usize) -> Result<usize, OperationError> {
        self.components.iter().try_fold(len, |len, c| c.apply_len(len))
    }

    /// Apply to a rope in place. Validates first, so a failed call leaves
    /// `rope` untouched.
    pub fn apply_to(&self, rope: &mut Rope) -> Result<(), OperationError> {
        self.validate(rope.len_chars())?;
        for component in &self.components {
            match component {
                Component::Insert { position, content } => rope.insert(*position, content),
                Component::Delete { position, length } => rope.remove(*position..*position + *length),
            }
        }
        Ok(())
    }

    /// Force every component into bounds of a `len`-character document.
    ///
    /// Used when pending edits are re-stamped against a fresh snapshot that
    /// no transform path connects them to.
    pub fn clamp_to(&self, len: usize) -> Operation {
        let mut len = len;
        let mut components = Vec::with_capacity(self.components.len());
        for component in &self.components {
            let clamped = match component {
                Component::Insert { position, content } => {
                    let position = (*position).min(len);
                    len += content.chars().count();
                    Component::Insert { position, content: content.clone() }
                }
                Component::Delete { position, length } => {
                    let position = (*position).min(len);
                    let length = (*length).min(len - position);
                    len -= length;
                    Component::Delete { position, length }
                }
            };
            components.push(clamped);
        }
        self.with_components(components)
    }
}

/// An operation that the sequencer has ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedOperation {
    pub op: Operation,
    /// Revision of the document after this operation; the `n`-th accepted
    /// operation carries revision `n`.
    pub revision: u64,
}

/// Merge two sequential edits of the same author into one.
///
/// `second` must have been authored against the state produced by `first`.
/// The result keeps `first`'s identity and base revision. Rapid keystrokes
/// (typing runs, backspace runs, deletes inside fresh text) collapse into a
/// single component; anything else is concatenated.
pub fn compose(first: &Operation, second: &Operation) -> Result<Operation, OperationError> {
    if first.document_id != second.document_id {
        return Err(OperationError::DocumentMismatch {
            expected: first.document_id,
            found: second.document_id,
        });
    }
    if first.author() != second.author() {
        return Err(OperationError::AuthorMismatch);
    }

    let mut stack: Vec<Component> = Vec::with_capacity(first.components.len() + second.components.len());
    for component in first.components.iter().chain(second.components.iter()).cloned() {
        stack.push(component);
        while stack.len() >= 2 {
            let b = &stack[stack.len() - 1];
            let a = &stack[stack.len() - 2];
            match merge_sequential(a, b) {
                Some(merged) => {
                    stack.truncate(stack.len() - 2);
                    if let Some(c) = merged {
                        stack.push(c);
                    }
                }
                None => break,
            }
        }
    }

    Ok(first.with_components(stack))
}

/// Merge `b` (applied after `a`) into one component.
///
/// `Some(None)` means the two cancel out, `None` that they don't merge.
fn merge_sequential(a: &Component, b: &Component) -> Option<Option<Component>> {
    match (a, b) {
        (Component::Insert { position: p, content: s }, Component::Insert { position: q, content: t }) => {
            let len = s.chars().count();
            if *q < *p || *q > p + len {
                return None;
            }
            let split = byte_index(s, q - p);
            let mut content = String::with_capacity(s.len() + t.len());
            content.push_str(&s[..split]);
            content.push_str(t);
            content.push_str(&s[split..]);
            Some(Some(Component::Insert { position: *p, content }))
        }
        (Component::Insert { position: p, content: s }, Component::Delete { position: q, length: n }) => {
            let len = s.chars().count();
            if *q >= *p && q + n <= p + len {
                // Delete entirely inside the fresh text.
                let from = byte_index(s, q - p);
                let to = byte_index(s, q - p + n);
                let mut content = String::with_capacity(s.len());
                content.push_str(&s[..from]);
                content.push_str(&s[to..]);
                if content.is_empty() {
                    Some(None)
                } else {
                    Some(Some(Component::Insert { position: *p, content }))
                }
            } else if *q <= *p && q + n >= p + len {
                // Delete swallows the fresh text and some original text.
                let remaining = n - len;
                if remaining == 0 {
                    Some(None)
                } else {
                    Some(Some(Component::Delete { position: *q, length: remaining }))
                }
            } else {
                None
            }
        }
        (Component::Delete { position: p, length: n }, Component::Delete { position: q, length: m }) => {
            if *q <= *p && *p <= q + m {
                Some(Some(Component::Delete { position: *q, length: n + m }))
            } else {
                None
            }
        }
        (Component::Delete { .. }, Component::Insert { .. }) => None,
    }
}

/// Byte index of the `chars`-th character of `s` (or `s.len()`).
fn byte_index(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

/// Operation model errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// A component addresses characters outside the document.
    OutOfBounds { position: usize, length: usize, document_len: usize },
    /// Operation targets a different document.
    DocumentMismatch { expected: DocumentId, found: DocumentId },
    /// Only edits of the same author can be composed.
    AuthorMismatch,
    /// Revision does not follow the document's current revision.
    RevisionGap { expected: u64, found: u64 },
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationError::OutOfBounds { position, length, document_len } => write!(
                f,
                "range {position}..{} outside document of {document_len} chars",
                position + length
            ),
            OperationError::DocumentMismatch { expected, found } => {
                write!(f, "operation targets document {found}, expected {expected}")
            }
            OperationError::AuthorMismatch => write!(f, "cannot compose edits of different authors"),
            OperationError::RevisionGap { expected, found } => {
                write!(f, "revision gap: expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for OperationError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seq: u64) -> OpId {
        OpId::new(Uuid::nil(), seq)
    }

    fn rope_after(text: &str, op: &Operation) -> String {
        let mut rope = Rope::from_str(text);
        op.apply_to(&mut rope).unwrap();
        rope.to_string()
    }

    #[test]
    fn test_opid_orders_by_author_then_seq() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        assert!(OpId::new(a, 9) < OpId::new(b, 0));
        assert!(OpId::new(a, 1) < OpId::new(a, 2));
    }

    #[test]
    fn test_noop_components_dropped() {
        let op = Operation::new(id(1), Uuid::nil(), 0, vec![Component::insert(0, ""), Component::delete(3, 0)]);
        assert!(op.components.is_empty());
        assert!(op.is_noop());
    }

    #[test]
    fn test_apply_insert_and_delete() {
        let doc = Uuid::nil();
        assert_eq!(rope_after("abc", &Operation::insert(id(1), doc, 0, 1, "X")), "aXbc");
        assert_eq!(rope_after("abc", &Operation::delete(id(1), doc, 0, 0, 2)), "c");
        assert_eq!(rope_after("abc", &Operation::replace(id(1), doc, 0, 1, 1, "ZZ")), "aZZc");
    }

    #[test]
    fn test_apply_counts_chars_not_bytes() {
        let doc = Uuid::nil();
        assert_eq!(rope_after("héllo", &Operation::delete(id(1), doc, 0, 1, 1)), "hllo");
        assert_eq!(rope_after("日本語", &Operation::insert(id(1), doc, 0, 3, "!")), "日本語!");
    }

    #[test]
    fn test_out_of_bounds_leaves_rope_untouched() {
        let mut rope = Rope::from_str("abc");
        let op = Operation::new(
            id(1),
            Uuid::nil(),
            0,
            vec![Component::insert(0, "zz"), Component::delete(4, 2)],
        );
        let err = op.apply_to(&mut rope).unwrap_err();
        assert!(matches!(err, OperationError::OutOfBounds { position: 4, length: 2, document_len: 5 }));
        assert_eq!(rope.to_string(), "abc");
    }

    #[test]
    fn test_validate_returns_final_length() {
        let op = Operation::replace(id(1), Uuid::nil(), 0, 0, 2, "hello");
        assert_eq!(op.validate(3), Ok(6));
    }

    #[test]
    fn test_clamp_to_shrinks_into_bounds() {
        let op = Operation::new(id(1), Uuid::nil(), 0, vec![Component::delete(2, 10), Component::insert(9, "x")]);
        let clamped = op.clamp_to(4);
        assert_eq!(clamped.components, vec![Component::delete(2, 2), Component::insert(2, "x")]);
        assert!(clamped.validate(4).is_ok());
    }

    #[test]
    fn test_compose_typing_run() {
        let doc = Uuid::nil();
        let a = Operation::insert(id(1), doc, 0, 3, "he");
        let b = Operation::insert(id(2), doc, 0, 5, "y");
        let c = compose(&a, &b).unwrap();
        assert_eq!(c.components, vec![Component::insert(3, "hey")]);
        assert_eq!(c.id, a.id);
    }

    #[test]
    fn test_compose_backspace_run() {
        let doc = Uuid::nil();
        let a = Operation::delete(id(1), doc, 0, 5, 1);
        let b = Operation::delete(id(2), doc, 0, 4, 1);
        assert_eq!(compose(&a, &b).unwrap().components, vec![Component::delete(4, 2)]);
    }

    #[test]
    fn test_compose_delete_inside_fresh_insert() {
        let doc = Uuid::nil();
        let a = Operation::insert(id(1), doc, 0, 0, "abc");
        let b = Operation::delete(id(2), doc, 0, 1, 1);
        assert_eq!(compose(&a, &b).unwrap().components, vec![Component::insert(0, "ac")]);

        let undo = Operation::delete(id(3), doc, 0, 0, 3);
        assert!(compose(&a, &undo).unwrap().is_noop());
    }

    #[test]
    fn test_compose_is_transparent() {
        let doc = Uuid::nil();
        let text = "fn main() {}";
        let a = Operation::insert(id(1), doc, 0, 11, "\n    println!();\n");
        let b = Operation::delete(id(2), doc, 0, 0, 3);
        let composed = compose(&a, &b).unwrap();
        assert_eq!(rope_after(text, &composed), rope_after(&rope_after(text, &a), &b));
    }

    #[test]
    fn test_compose_rejects_foreign_author() {
        let doc = Uuid::nil();
        let a = Operation::insert(id(1), doc, 0, 0, "a");
        let b = Operation::insert(OpId::new(Uuid::from_u128(7), 1), doc, 0, 1, "b");
        assert_eq!(compose(&a, &b), Err(OperationError::AuthorMismatch));
    }

    #[test]
    fn test_error_display() {
        let err = OperationError::OutOfBounds { position: 4, length: 2, document_len: 3 };
        assert!(err.to_string().contains("4..6"));
    }
}
