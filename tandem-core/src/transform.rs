//! Operational transformation of concurrent edits.
//!
//! Two operations `a` and `b` are concurrent when both were authored against
//! the same document state. `transform(a, b)` restates `a` so that it
//! applies after `b`; `transform_pair` yields both sides of the diamond:
//!
//! ```text
//!        S
//!     a / \ b
//!      /   \
//!   S·a     S·b
//!      \   /
//!    b' \ / a'
//!      S·a·b' == S·b·a'
//! ```
//!
//! Ties between inserts at the same offset go to the smaller [`OpId`].

use crate::operation::{Component, OpId, Operation};

/// What happened to one side while it was being transformed.
///
/// A plain position shift is not reported; only changes to the effective
/// range or placement of the edit are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformReport {
    /// A delete lost characters the other side had already removed.
    pub clipped: bool,
    /// A delete was cut in two around text the other side inserted.
    pub split: bool,
    /// An insert landed inside a range the other side removed.
    pub relocated: bool,
}

impl TransformReport {
    pub fn overlapped(&self) -> bool {
        self.clipped || self.split || self.relocated
    }

    pub fn merge(&mut self, other: TransformReport) {
        self.clipped |= other.clipped;
        self.split |= other.split;
        self.relocated |= other.relocated;
    }
}

/// Cursor stickiness at an insertion point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    /// Stay in front of text inserted exactly at the offset.
    Before,
    /// Move past text inserted exactly at the offset.
    After,
}

/// Restate `a` so it applies after the concurrent `b`.
pub fn transform(a: &Operation, b: &Operation) -> Operation {
    transform_with_report(a, b).0
}

/// Like [`transform`], also reporting whether `a` was clipped, split or
/// relocated.
pub fn transform_with_report(a: &Operation, b: &Operation) -> (Operation, TransformReport) {
    let (a_prime, _, report, _) = transform_pair_with_report(a, b);
    (a_prime, report)
}

/// Both sides of the diamond: `(a', b')` with `a'` applying after `b` and
/// `b'` applying after `a`.
pub fn transform_pair(a: &Operation, b: &Operation) -> (Operation, Operation) {
    let (a_prime, b_prime, _, _) = transform_pair_with_report(a, b);
    (a_prime, b_prime)
}

pub fn transform_pair_with_report(
    a: &Operation,
    b: &Operation,
) -> (Operation, Operation, TransformReport, TransformReport) {
    let a_first = wins_tie(a.id, b.id);
    let mut report_a = TransformReport::default();
    let mut report_b = TransformReport::default();
    let (ca, cb) = transform_lists(&a.components, &b.components, a_first, &mut report_a, &mut report_b);
    (a.with_components(ca), b.with_components(cb), report_a, report_b)
}

fn wins_tie(a: OpId, b: OpId) -> bool {
    a < b
}

/// Map a character offset through `op`.
pub fn transform_offset(offset: usize, op: &Operation, bias: Bias) -> usize {
    op.components
        .iter()
        .fold(offset, |offset, component| transform_offset_component(offset, component, bias))
}

fn transform_offset_component(offset: usize, component: &Component, bias: Bias) -> usize {
    match component {
        Component::Insert { position, content } => {
            if offset > *position || (offset == *position && bias == Bias::After) {
                offset + content.chars().count()
            } else {
                offset
            }
        }
        Component::Delete { position, length } => {
            if offset >= position + length {
                offset - length
            } else if offset > *position {
                *position
            } else {
                offset
            }
        }
    }
}

/// Map a `[start, end)` range through `op`; the range never inverts.
pub fn transform_range(start: usize, end: usize, op: &Operation) -> (usize, usize) {
    let new_start = transform_offset(start, op, Bias::After);
    let new_end = transform_offset(end, op, Bias::Before).max(new_start);
    (new_start, new_end)
}

fn transform_lists(
    a: &[Component],
    b: &[Component],
    a_first: bool,
    report_a: &mut TransformReport,
    report_b: &mut TransformReport,
) -> (Vec<Component>, Vec<Component>) {
    match (a, b) {
        ([], _) => (Vec::new(), b.to_vec()),
        (_, []) => (a.to_vec(), Vec::new()),
        ([ca], [cb]) => {
            let (xa, xb, ra, rb) = transform_components(ca, cb, a_first);
            report_a.merge(ra);
            report_b.merge(rb);
            (xa, xb)
        }
        ([head, rest @ ..], _) if !rest.is_empty() => {
            // head and b share a base; rest follows head and so shares a base
            // with b restated past head.
            let (head_prime, b_after_head) =
                transform_lists(std::slice::from_ref(head), b, a_first, report_a, report_b);
            let (rest_prime, b_prime) = transform_lists(rest, &b_after_head, a_first, report_a, report_b);
            let mut out = head_prime;
            out.extend(rest_prime);
            (out, b_prime)
        }
        (_, [head, rest @ ..]) => {
            let (a_after_head, head_prime) =
                transform_lists(a, std::slice::from_ref(head), a_first, report_a, report_b);
            let (a_prime, rest_prime) = transform_lists(&a_after_head, rest, a_first, report_a, report_b);
            let mut out = head_prime;
            out.extend(rest_prime);
            (a_prime, out)
        }
    }
}

/// Transform two concurrent components against each other.
fn transform_components(
    a: &Component,
    b: &Component,
    a_first: bool,
) -> (Vec<Component>, Vec<Component>, TransformReport, TransformReport) {
    use Component::{Delete, Insert};

    let mut ra = TransformReport::default();
    let mut rb = TransformReport::default();

    let (xa, xb) = match (a, b) {
        (Insert { position: p, content: s }, Insert { position: q, content: t }) => {
            let (la, lb) = (s.chars().count(), t.chars().count());
            if p < q || (p == q && a_first) {
                (vec![a.clone()], vec![b.with_position(q + la)])
            } else {
                (vec![a.with_position(p + lb)], vec![b.clone()])
            }
        }
        (Insert { position: p, content: s }, Delete { position: q, length: n }) => {
            insert_vs_delete(*p, s, *q, *n, &mut ra, &mut rb)
        }
        (Delete { position: p, length: n }, Insert { position: q, content: t }) => {
            let (xb, xa) = insert_vs_delete(*q, t, *p, *n, &mut rb, &mut ra);
            (xa, xb)
        }
        (Delete { position: p, length: n }, Delete { position: q, length: m }) => {
            let xa = delete_past_delete(*p, *n, *q, *m, &mut ra);
            let xb = delete_past_delete(*q, *m, *p, *n, &mut rb);
            (xa, xb)
        }
    };

    (xa, xb, ra, rb)
}

/// Insert at `p` concurrent with a delete of `[q, q + n)`.
///
/// Returns the insert restated after the delete and the delete restated
/// after the insert.
fn insert_vs_delete(
    p: usize,
    content: &str,
    q: usize,
    n: usize,
    report_insert: &mut TransformReport,
    report_delete: &mut TransformReport,
) -> (Vec<Component>, Vec<Component>) {
    let la = content.chars().count();
    if p <= q {
        (vec![Component::insert(p, content)], vec![Component::delete(q + la, n)])
    } else if p >= q + n {
        (vec![Component::insert(p - n, content)], vec![Component::delete(q, n)])
    } else {
        // The insert sits strictly inside the deleted range: keep the new
        // text at the deletion start and delete around it.
        report_insert.relocated = true;
        report_delete.split = true;
        (
            vec![Component::insert(q, content)],
            vec![Component::delete(q, p - q), Component::delete(q + la, q + n - p)],
        )
    }
}

/// Delete `[p, p + n)` restated after a concurrent delete of `[q, q + m)`.
fn delete_past_delete(p: usize, n: usize, q: usize, m: usize, report: &mut TransformReport) -> Vec<Component> {
    if p + n <= q {
        return vec![Component::delete(p, n)];
    }
    if q + m <= p {
        return vec![Component::delete(p - m, n)];
    }
    let overlap = (p + n).min(q + m) - p.max(q);
    report.clipped = true;
    let remaining = n - overlap;
    if remaining == 0 {
        Vec::new()
    } else {
        vec![Component::delete(p.min(q), remaining)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ropey::Rope;
    use uuid::Uuid;

    fn op(author: u128, components: Vec<Component>) -> Operation {
        Operation::new(OpId::new(Uuid::from_u128(author), 1), Uuid::nil(), 0, components)
    }

    fn apply(text: &str, op: &Operation) -> String {
        let mut rope = Rope::from_str(text);
        op.apply_to(&mut rope).unwrap();
        rope.to_string()
    }

    fn assert_diamond(text: &str, a: &Operation, b: &Operation) -> String {
        let (a_prime, b_prime) = transform_pair(a, b);
        let left = apply(&apply(text, a), &b_prime);
        let right = apply(&apply(text, b), &a_prime);
        assert_eq!(left, right, "diverged on {a:?} vs {b:?}");
        left
    }

    #[test]
    fn test_insert_insert_same_offset_smaller_id_first() {
        let a = op(1, vec![Component::insert(1, "A")]);
        let b = op(2, vec![Component::insert(1, "B")]);
        assert_eq!(assert_diamond("xy", &a, &b), "xABy");
        assert_eq!(assert_diamond("xy", &b, &a), "xABy");
    }

    #[test]
    fn test_insert_shifts_past_earlier_insert() {
        let a = op(1, vec![Component::insert(3, "!")]);
        let b = op(2, vec![Component::insert(0, ">> ")]);
        let a_prime = transform(&a, &b);
        assert_eq!(a_prime.components, vec![Component::insert(6, "!")]);
    }

    #[test]
    fn test_delete_delete_overlap_shrinks() {
        let a = op(1, vec![Component::delete(1, 3)]);
        let b = op(2, vec![Component::delete(2, 3)]);
        let (a_prime, report) = transform_with_report(&a, &b);
        assert_eq!(a_prime.components, vec![Component::delete(1, 1)]);
        assert!(report.clipped);
        assert_eq!(assert_diamond("abcdefg", &a, &b), "afg");
    }

    #[test]
    fn test_covered_delete_becomes_noop() {
        let a = op(1, vec![Component::delete(2, 2)]);
        let b = op(2, vec![Component::delete(1, 4)]);
        assert!(transform(&a, &b).is_noop());
        assert_eq!(assert_diamond("abcdefg", &a, &b), "afg");
    }

    #[test]
    fn test_insert_inside_deleted_range_relocates() {
        let a = op(1, vec![Component::insert(2, "XY")]);
        let b = op(2, vec![Component::delete(1, 3)]);
        let (a_prime, b_prime, ra, rb) = transform_pair_with_report(&a, &b);
        assert_eq!(a_prime.components, vec![Component::insert(1, "XY")]);
        assert_eq!(b_prime.components, vec![Component::delete(1, 1), Component::delete(3, 2)]);
        assert!(ra.relocated);
        assert!(rb.split);
        assert_eq!(assert_diamond("abcde", &a, &b), "aXYe");
    }

    #[test]
    fn test_insert_at_delete_edges_is_not_overlap() {
        let b = op(2, vec![Component::delete(1, 2)]);
        let before = op(1, vec![Component::insert(1, "X")]);
        let after = op(1, vec![Component::insert(3, "X")]);
        assert!(!transform_with_report(&before, &b).1.overlapped());
        assert!(!transform_with_report(&after, &b).1.overlapped());
        assert_eq!(assert_diamond("abcd", &before, &b), "aXd");
        assert_eq!(assert_diamond("abcd", &after, &b), "aXd");
    }

    #[test]
    fn test_multi_component_against_multi_component() {
        let a = op(1, vec![Component::delete(0, 2), Component::insert(0, "new"), Component::insert(5, "!")]);
        let b = op(2, vec![Component::insert(1, "Q"), Component::delete(4, 2)]);
        assert_diamond("abcdefgh", &a, &b);
    }

    #[test]
    fn test_transform_keeps_identity() {
        let a = Operation::insert(OpId::new(Uuid::from_u128(1), 4), Uuid::nil(), 7, 0, "x");
        let b = op(2, vec![Component::insert(0, "y")]);
        let a_prime = transform(&a, &b);
        assert_eq!(a_prime.id, a.id);
        assert_eq!(a_prime.base_revision, 7);
    }

    #[test]
    fn test_transform_offset_bias() {
        let ins = op(1, vec![Component::insert(2, "abc")]);
        assert_eq!(transform_offset(2, &ins, Bias::Before), 2);
        assert_eq!(transform_offset(2, &ins, Bias::After), 5);
        assert_eq!(transform_offset(1, &ins, Bias::After), 1);

        let del = op(1, vec![Component::delete(2, 3)]);
        assert_eq!(transform_offset(4, &del, Bias::After), 2);
        assert_eq!(transform_offset(7, &del, Bias::After), 4);
        assert_eq!(transform_offset(1, &del, Bias::After), 1);
    }

    #[test]
    fn test_transform_range_never_inverts() {
        let del = op(1, vec![Component::delete(0, 10)]);
        assert_eq!(transform_range(2, 6, &del), (0, 0));
        let ins = op(1, vec![Component::insert(3, "xx")]);
        assert_eq!(transform_range(3, 3, &ins), (5, 5));
        assert_eq!(transform_range(1, 3, &ins), (1, 3));
    }
}
