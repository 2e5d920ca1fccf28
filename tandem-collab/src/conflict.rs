//! Conflict surfacing.
//!
//! A conflict is recorded when a pending local operation overlapped a
//! concurrent remote one while being rebased (a delete clipped or split, an
//! insert relocated). It stays hidden until the local operation is
//! acknowledged; then, unless the text already matches local intent, it is
//! surfaced to the user. Nothing is merged silently: every resolution other
//! than [`Resolution::AcceptRemote`] becomes a new local edit.

use tandem_core::{transform_range, Document, OpId, Operation};

/// A contested span of the local view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub id: u64,
    /// Local operation whose intent was altered
    pub op_id: OpId,
    /// `[start, end)` in the current view
    pub region: (usize, usize),
    /// What the region would hold under local intent
    pub local: String,
    /// What the region holds now
    pub remote: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    AcceptRemote,
    Manual(String),
}

#[derive(Debug, Clone)]
struct Candidate {
    op_id: OpId,
    region: (usize, usize),
    local: String,
}

/// Conflicts of one replica.
#[derive(Debug, Default)]
pub struct ConflictSet {
    /// Recorded against operations not yet acknowledged
    awaiting_ack: Vec<Candidate>,
    open: Vec<Conflict>,
    next_id: u64,
}

impl ConflictSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that `op_id`'s intent was altered over `region` of the view.
    ///
    /// A second overlap on the same operation widens the region and keeps
    /// the first recorded intent.
    pub fn record(&mut self, op_id: OpId, region: (usize, usize), local: String) {
        if let Some(existing) = self.awaiting_ack.iter_mut().find(|c| c.op_id == op_id) {
            existing.region = (existing.region.0.min(region.0), existing.region.1.max(region.1));
            return;
        }
        self.awaiting_ack.push(Candidate { op_id, region, local });
    }

    /// Surface the conflict recorded for an acknowledged operation, if the
    /// view does not already hold the local intent.
    pub fn acknowledge(&mut self, op_id: OpId, view: &Document) -> Option<Conflict> {
        let index = self.awaiting_ack.iter().position(|c| c.op_id == op_id)?;
        let candidate = self.awaiting_ack.remove(index);
        let remote = view.slice(candidate.region.0, candidate.region.1);
        if remote == candidate.local {
            return None;
        }

        self.next_id += 1;
        let conflict = Conflict {
            id: self.next_id,
            op_id,
            region: candidate.region,
            local: candidate.local,
            remote,
        };
        log::debug!("Conflict {} surfaced over {:?}", conflict.id, conflict.region);
        self.open.push(conflict.clone());
        Some(conflict)
    }

    /// Forget a candidate whose operation was discarded.
    pub fn discard(&mut self, op_id: OpId) {
        self.awaiting_ack.retain(|c| c.op_id != op_id);
    }

    /// Move every region through an operation applied to `view`, refreshing
    /// the remote text of open conflicts.
    pub fn rebase(&mut self, op: &Operation, view: &Document) {
        for candidate in &mut self.awaiting_ack {
            candidate.region = transform_range(candidate.region.0, candidate.region.1, op);
        }
        for conflict in &mut self.open {
            conflict.region = transform_range(conflict.region.0, conflict.region.1, op);
            conflict.remote = view.slice(conflict.region.0, conflict.region.1);
        }
    }

    /// Remove an open conflict for resolution.
    pub fn take(&mut self, id: u64) -> Option<Conflict> {
        let index = self.open.iter().position(|c| c.id == id)?;
        Some(self.open.remove(index))
    }

    pub fn open(&self) -> &[Conflict] {
        &self.open
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.awaiting_ack.is_empty()
    }

    /// Drop everything; regions mean nothing after a snapshot reset.
    pub fn clear(&mut self) {
        self.awaiting_ack.clear();
        self.open.clear();
    }
}

/// Smallest differing span between two texts.
///
/// Returns `(start, a_end, b_end)` in characters: the texts agree before
/// `start` and after `a_end` in `a` / `b_end` in `b`. `None` when equal.
pub(crate) fn diff_hull(a: &str, b: &str) -> Option<(usize, usize, usize)> {
    if a == b {
        return None;
    }
    let a_len = a.chars().count();
    let b_len = b.chars().count();
    let prefix = a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count();
    let max_suffix = a_len.min(b_len) - prefix;
    let suffix = a
        .chars()
        .rev()
        .zip(b.chars().rev())
        .take(max_suffix)
        .take_while(|(x, y)| x == y)
        .count();
    Some((prefix, a_len - suffix, b_len - suffix))
}
