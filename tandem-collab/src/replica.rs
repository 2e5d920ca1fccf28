//! Client-side document replica.
//!
//! ```text
//!   confirmed ──► in_flight ──► buffer[0] ──► buffer[1] ... ──► view
//!   (server rev)   (sent, ≤1)     (queued local edits)          (shown)
//! ```
//!
//! Local edits apply to the view at once and queue in the buffer. One
//! operation at a time travels to the server. A foreign accepted operation
//! advances `confirmed`, is transformed through every pending operation and
//! then applied to the view; the pending operations are restated after it.
//! The replica does no I/O; the connection manager drives it.

use std::collections::VecDeque;

use tandem_core::{
    compose, transform_pair_with_report, transform_range, AcceptedOperation, Component, Document, DocumentId,
    OpId, Operation, OperationError, ParticipantId, Snapshot,
};
use uuid::Uuid;

use crate::conflict::{diff_hull, Conflict, ConflictSet, Resolution};
use crate::protocol::RejectReason;

/// Something the connection manager or the UI must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// A foreign operation, in the form applied to the view
    Applied(Operation),
    Acknowledged { op_id: OpId, revision: u64 },
    ConflictSurfaced(Conflict),
    /// Rejoin. `fresh` asks for a full snapshot instead of a replay.
    ResyncRequired { fresh: bool },
    /// The server refused this local operation for good
    Discarded(Operation),
    /// Submission not accepted yet; resend after a backoff
    Deferred(OpId),
    /// The session token is no longer valid
    RejoinRequired,
    /// View replaced from a snapshot; pending edits were clamped onto it
    Reset { revision: u64 },
}

#[derive(Debug, Clone)]
pub enum ReplicaError {
    Operation(OperationError),
    UnknownConflict(u64),
}

impl std::fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaError::Operation(e) => write!(f, "Invalid edit: {e}"),
            ReplicaError::UnknownConflict(id) => write!(f, "No open conflict {id}"),
        }
    }
}

impl std::error::Error for ReplicaError {}

impl From<OperationError> for ReplicaError {
    fn from(e: OperationError) -> Self {
        ReplicaError::Operation(e)
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    /// Current form, relative to `confirmed`
    op: Operation,
    /// As submitted, with the base revision stamped when it was sent
    sent: Operation,
}

/// Pending region recorded while rebasing, in coordinates of the state
/// after the operations processed so far.
struct Carried {
    op_id: OpId,
    region: (usize, usize),
    local: String,
}

pub struct Replica {
    participant: ParticipantId,
    confirmed: Document,
    view: Document,
    in_flight: Option<InFlight>,
    buffer: VecDeque<Operation>,
    next_seq: u64,
    conflicts: ConflictSet,
    /// Next join must replace the view from the snapshot
    needs_fresh: bool,
}

impl Replica {
    pub fn new(participant: ParticipantId, document_id: DocumentId) -> Self {
        Self::from_snapshot(participant, &Snapshot::empty(document_id))
    }

    pub fn from_snapshot(participant: ParticipantId, snapshot: &Snapshot) -> Self {
        let confirmed = Document::from_snapshot(snapshot);
        Self {
            participant,
            view: confirmed.clone(),
            confirmed,
            in_flight: None,
            buffer: VecDeque::new(),
            // Random start so two sessions of one participant never reuse an OpId.
            next_seq: Uuid::new_v4().as_u64_pair().0 >> 24,
            conflicts: ConflictSet::new(),
            needs_fresh: true,
        }
    }

    // ── Local edits ─────────────────────────────────────────────

    pub fn insert(&mut self, position: usize, text: &str) -> Result<Operation, ReplicaError> {
        self.local_edit(vec![Component::insert(position, text)])
    }

    pub fn delete(&mut self, position: usize, length: usize) -> Result<Operation, ReplicaError> {
        self.local_edit(vec![Component::delete(position, length)])
    }

    pub fn replace(&mut self, position: usize, length: usize, text: &str) -> Result<Operation, ReplicaError> {
        self.local_edit(vec![Component::delete(position, length), Component::insert(position, text)])
    }

    fn local_edit(&mut self, components: Vec<Component>) -> Result<Operation, ReplicaError> {
        let id = OpId::new(self.participant, self.next_seq);
        let op = Operation::new(id, self.confirmed.id(), self.confirmed.revision(), components);
        if op.is_noop() {
            return Ok(op);
        }
        self.view.apply_in_place(&op)?;
        self.next_seq += 1;
        self.conflicts.rebase(&op, &self.view);

        // Typing runs collapse into the queued operation.
        if let Some(last) = self.buffer.back_mut() {
            if let Ok(composed) = compose(last, &op) {
                if composed.components.len() == 1 {
                    *last = composed;
                    return Ok(op);
                }
            }
        }
        self.buffer.push_back(op.clone());
        Ok(op)
    }

    // ── Outgoing ────────────────────────────────────────────────

    /// Next operation to submit, if nothing is in flight.
    pub fn next_submission(&mut self) -> Option<Operation> {
        if self.in_flight.is_some() {
            return None;
        }
        let op = self.buffer.pop_front()?.with_base_revision(self.confirmed.revision());
        self.in_flight = Some(InFlight { op: op.clone(), sent: op.clone() });
        Some(op)
    }

    /// The in-flight operation exactly as first sent, for resubmission.
    pub fn resubmission(&self) -> Option<Operation> {
        self.in_flight.as_ref().map(|f| f.sent.clone())
    }

    // ── Incoming ────────────────────────────────────────────────

    /// Process an accepted operation from the server, in revision order.
    pub fn receive(&mut self, accepted: &AcceptedOperation) -> Vec<ReplicaEvent> {
        let current = self.confirmed.revision();
        let in_flight_id = self.in_flight.as_ref().map(|f| f.op.id);

        if accepted.revision <= current {
            if in_flight_id == Some(accepted.op.id) {
                // Accepted before a snapshot reset that already contains it.
                log::warn!("Operation {} acknowledged at old revision {}", accepted.op.id, accepted.revision);
                self.in_flight = None;
                return self.request_fresh();
            }
            return Vec::new();
        }
        if accepted.revision > current + 1 {
            log::warn!("Revision gap: at {current}, received {}", accepted.revision);
            return vec![ReplicaEvent::ResyncRequired { fresh: false }];
        }

        if in_flight_id == Some(accepted.op.id) {
            return self.acknowledge(accepted);
        }
        self.apply_foreign(accepted)
    }

    fn acknowledge(&mut self, accepted: &AcceptedOperation) -> Vec<ReplicaEvent> {
        if self.confirmed.commit(accepted).is_err() {
            return self.request_fresh();
        }
        let Some(pending) = self.in_flight.take() else {
            return Vec::new();
        };

        let op_id = accepted.op.id;
        let mut events = vec![ReplicaEvent::Acknowledged { op_id, revision: accepted.revision }];
        if pending.op.components != accepted.op.components {
            log::warn!("Operation {op_id} accepted in an unexpected form, resynchronising");
            events.extend(self.request_fresh());
            return events;
        }
        if let Some(conflict) = self.conflicts.acknowledge(op_id, &self.view) {
            events.push(ReplicaEvent::ConflictSurfaced(conflict));
        }
        events
    }

    fn apply_foreign(&mut self, accepted: &AcceptedOperation) -> Vec<ReplicaEvent> {
        // State every pending operation and the incoming one agree on.
        let mut base = self.confirmed.clone();
        if self.confirmed.commit(accepted).is_err() {
            return self.request_fresh();
        }

        let mut incoming = accepted.op.clone();
        let mut carried: Vec<Carried> = Vec::new();
        let mut diverged = false;

        let pending = self
            .in_flight
            .iter_mut()
            .map(|f| &mut f.op)
            .chain(self.buffer.iter_mut());
        for op in pending {
            let (op_prime, incoming_prime, report, _) = transform_pair_with_report(op, &incoming);

            for c in &mut carried {
                c.region = transform_range(c.region.0, c.region.1, &op_prime);
            }
            if report.overlapped() {
                if let Some(c) = overlap_region(&base, op, &incoming, &op_prime) {
                    carried.push(c);
                }
            }

            if base.apply_in_place(op).is_err() {
                diverged = true;
                break;
            }
            *op = op_prime;
            incoming = incoming_prime;
        }

        if diverged || self.view.apply_in_place(&incoming).is_err() {
            return self.request_fresh();
        }
        self.conflicts.rebase(&incoming, &self.view);
        for c in carried {
            self.conflicts.record(c.op_id, c.region, c.local);
        }
        vec![ReplicaEvent::Applied(incoming)]
    }

    /// The server refused the in-flight operation.
    pub fn on_rejected(&mut self, op_id: OpId, reason: RejectReason) -> Vec<ReplicaEvent> {
        if self.in_flight.as_ref().map(|f| f.op.id) != Some(op_id) {
            return Vec::new();
        }
        log::warn!("Operation {op_id} rejected: {reason}");
        match reason {
            RejectReason::InvalidRange => {
                let mut events = Vec::new();
                if let Some(pending) = self.in_flight.take() {
                    self.conflicts.discard(op_id);
                    events.push(ReplicaEvent::Discarded(pending.op));
                }
                events.extend(self.request_fresh());
                events
            }
            RejectReason::StaleSubmission => self.request_fresh(),
            RejectReason::SequencerUnavailable => vec![ReplicaEvent::Deferred(op_id)],
            RejectReason::UnknownSession => vec![ReplicaEvent::RejoinRequired],
        }
    }

    fn request_fresh(&mut self) -> Vec<ReplicaEvent> {
        self.needs_fresh = true;
        vec![ReplicaEvent::ResyncRequired { fresh: true }]
    }

    /// Revision to report when rejoining, `None` when a full snapshot is
    /// needed.
    pub fn last_seen_revision(&self) -> Option<u64> {
        (!self.needs_fresh).then(|| self.confirmed.revision())
    }

    /// Bring the replica up to a `JoinAck`.
    ///
    /// `missed` is replayed when it continues exactly from the confirmed
    /// revision; otherwise the view is rebuilt from the snapshot.
    pub fn on_join_ack(&mut self, snapshot: &Snapshot, missed: &[AcceptedOperation]) -> Vec<ReplicaEvent> {
        if !self.needs_fresh && snapshot.document_id == self.confirmed.id() {
            let contiguous = missed
                .iter()
                .enumerate()
                .all(|(i, a)| a.revision == self.confirmed.revision() + 1 + i as u64);
            let reaches = self.confirmed.revision() + missed.len() as u64 == snapshot.revision;

            if contiguous && reaches {
                let mut events = Vec::new();
                for accepted in missed {
                    events.extend(self.receive(accepted));
                    if self.needs_fresh {
                        break;
                    }
                }
                if !self.needs_fresh && self.confirmed.text() == snapshot.content {
                    return events;
                }
                log::warn!("Replay did not reproduce revision {}, resetting", snapshot.revision);
            }
        }
        vec![self.reset_to_snapshot(snapshot)]
    }

    /// Replace confirmed state with `snapshot`; pending edits follow clamped.
    pub fn reset_to_snapshot(&mut self, snapshot: &Snapshot) -> ReplicaEvent {
        self.confirmed = Document::from_snapshot(snapshot);
        if let Some(pending) = self.in_flight.take() {
            self.buffer.push_front(pending.op);
        }

        let mut view = self.confirmed.clone();
        let mut rebuilt = VecDeque::with_capacity(self.buffer.len());
        for op in self.buffer.drain(..) {
            let clamped = Operation::new(op.id, snapshot.document_id, snapshot.revision, op.components.clone())
                .clamp_to(view.len_chars());
            if clamped.is_noop() || view.apply_in_place(&clamped).is_err() {
                continue;
            }
            rebuilt.push_back(clamped);
        }
        self.buffer = rebuilt;
        self.view = view;
        self.conflicts.clear();
        self.needs_fresh = false;

        log::info!(
            "Replica reset to revision {} with {} pending edits",
            snapshot.revision,
            self.buffer.len()
        );
        ReplicaEvent::Reset { revision: snapshot.revision }
    }

    // ── Conflicts ───────────────────────────────────────────────

    /// Apply a resolution. Returns the queued edit, `None` for
    /// [`Resolution::AcceptRemote`].
    pub fn resolve(&mut self, conflict_id: u64, resolution: Resolution) -> Result<Option<Operation>, ReplicaError> {
        let conflict = self.conflicts.take(conflict_id).ok_or(ReplicaError::UnknownConflict(conflict_id))?;
        let text = match resolution {
            Resolution::AcceptRemote => return Ok(None),
            Resolution::KeepLocal => conflict.local,
            Resolution::Manual(text) => text,
        };
        let (start, end) = conflict.region;
        self.replace(start, end - start, &text).map(Some)
    }

    pub fn conflicts(&self) -> &[Conflict] {
        self.conflicts.open()
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    pub fn document_id(&self) -> DocumentId {
        self.confirmed.id()
    }

    /// Last revision confirmed by the server.
    pub fn revision(&self) -> u64 {
        self.confirmed.revision()
    }

    /// Optimistic text including pending edits.
    pub fn text(&self) -> String {
        self.view.text()
    }

    pub fn view(&self) -> &Document {
        &self.view
    }

    pub fn confirmed_text(&self) -> String {
        self.confirmed.text()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// In-flight plus buffered operations.
    pub fn pending_len(&self) -> usize {
        self.buffer.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_synced(&self) -> bool {
        self.pending_len() == 0
    }
}

/// Region of the post-merge state where `op`'s intent differs from the
/// merged result, and what local intent holds there.
fn overlap_region(base: &Document, op: &Operation, incoming: &Operation, op_prime: &Operation) -> Option<Carried> {
    let intent = base.apply(op).ok()?.text();
    let merged = base.apply(incoming).ok()?.apply(op_prime).ok()?.text();
    let (start, intent_end, merged_end) = diff_hull(&intent, &merged)?;
    let local: String = intent.chars().skip(start).take(intent_end - start).collect();
    Some(Carried { op_id: op.id, region: (start, merged_end), local })
}
