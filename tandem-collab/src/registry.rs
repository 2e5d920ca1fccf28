//! Session registry: document rooms, participant sessions and routing.
//!
//! ```text
//! SessionRegistry
//!   ├── rooms:    doc_id → DocumentRoom
//!   │                ├── Mutex<Sequencer>      (one submission at a time)
//!   │                ├── BroadcastGroup        (ordered fan-out)
//!   │                ├── RwLock<PresenceTracker>
//!   │                └── members
//!   └── sessions: token  → ParticipantSession
//! ```
//!
//! Lock order is `rooms` → `sequencer` → `presence`; `sessions` is never
//! held across another lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tandem_core::{AcceptedOperation, DocumentId, Operation, ParticipantId, Snapshot};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::broadcast::{BroadcastGroup, BroadcastStats, Envelope};
use crate::presence::PresenceTracker;
use crate::protocol::{ParticipantInfo, Presence, ProtocolError, SessionToken, SyncMessage};
use crate::retry::{with_retry, RetryPolicy};
use crate::sequencer::{Sequenced, Sequencer, SubmitError};
use crate::storage::{OperationStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
}

/// Server-side record of one joined participant.
#[derive(Debug, Clone)]
pub struct ParticipantSession {
    pub token: SessionToken,
    pub participant: ParticipantInfo,
    pub document_id: DocumentId,
    pub state: SessionState,
    /// Last accepted revision delivered to this session
    pub last_seen_revision: u64,
    pub last_heartbeat: Instant,
}

/// Registry limits and retry behaviour.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub broadcast_capacity: usize,
    pub max_peers_per_room: usize,
    pub append_retry: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_peers_per_room: 100,
            append_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RegistryError {
    RoomFull { document_id: DocumentId, limit: usize },
    UnknownSession(SessionToken),
    Store(StoreError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::RoomFull { document_id, limit } => {
                write!(f, "Document {document_id} already has {limit} participants")
            }
            RegistryError::UnknownSession(token) => write!(f, "Unknown session {token}"),
            RegistryError::Store(e) => write!(f, "Store error: {e}"),
            RegistryError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        RegistryError::Store(e)
    }
}

impl From<ProtocolError> for RegistryError {
    fn from(e: ProtocolError) -> Self {
        RegistryError::Protocol(e)
    }
}

/// Everything a joiner needs to start.
pub struct JoinOutcome {
    pub token: SessionToken,
    pub snapshot: Snapshot,
    pub participants: Vec<ParticipantInfo>,
    pub presences: Vec<Presence>,
    /// Accepted after the reported `last_seen_revision`; empty when that
    /// revision is unknown or absent
    pub missed: Vec<AcceptedOperation>,
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
}

impl JoinOutcome {
    pub fn ack(&self) -> SyncMessage {
        SyncMessage::JoinAck {
            snapshot: self.snapshot.clone(),
            revision: self.snapshot.revision,
            session_token: self.token,
            participants: self.participants.clone(),
            presences: self.presences.clone(),
            missed: self.missed.clone(),
        }
    }
}

struct DocumentRoom {
    sequencer: Mutex<Sequencer>,
    broadcast: BroadcastGroup,
    presence: RwLock<PresenceTracker>,
    members: RwLock<HashMap<SessionToken, ParticipantInfo>>,
}

impl DocumentRoom {
    fn new(sequencer: Sequencer, broadcast_capacity: usize) -> Self {
        Self {
            sequencer: Mutex::new(sequencer),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            presence: RwLock::new(PresenceTracker::new()),
            members: RwLock::new(HashMap::new()),
        }
    }

    /// Distinct participants, in no particular order.
    async fn participants(&self) -> Vec<ParticipantInfo> {
        let members = self.members.read().await;
        let mut seen = HashSet::new();
        members
            .values()
            .filter(|info| seen.insert(info.participant_id))
            .cloned()
            .collect()
    }
}

pub struct SessionRegistry {
    rooms: RwLock<HashMap<DocumentId, Arc<DocumentRoom>>>,
    sessions: RwLock<HashMap<SessionToken, ParticipantSession>>,
    store: Arc<dyn OperationStore>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn OperationStore>, config: RegistryConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    /// Load every stored document into a room. Returns the number loaded.
    pub async fn recover_all(&self) -> Result<usize, StoreError> {
        let ids = self.store.list_documents()?;
        let mut rooms = self.rooms.write().await;
        for id in &ids {
            if !rooms.contains_key(id) {
                let sequencer = Sequencer::recover(*id, self.store.as_ref())?;
                rooms.insert(*id, Arc::new(DocumentRoom::new(sequencer, self.config.broadcast_capacity)));
            }
        }
        log::info!("Recovery complete: {}/{} documents restored", rooms.len(), ids.len());
        Ok(ids.len())
    }

    /// Join `participant` to a document.
    ///
    /// The broadcast subscription and the snapshot are taken under the
    /// sequencer lock, so every accepted operation is either in the snapshot
    /// or delivered through the receiver.
    pub async fn join(
        &self,
        document_id: DocumentId,
        participant: ParticipantInfo,
        last_seen_revision: Option<u64>,
    ) -> Result<JoinOutcome, RegistryError> {
        let token = SessionToken::generate();
        let room = {
            let mut rooms = self.rooms.write().await;
            let room = match rooms.get(&document_id) {
                Some(room) => room.clone(),
                None => {
                    let sequencer = Sequencer::recover(document_id, self.store.as_ref())?;
                    let room = Arc::new(DocumentRoom::new(sequencer, self.config.broadcast_capacity));
                    rooms.insert(document_id, room.clone());
                    room
                }
            };
            {
                let mut members = room.members.write().await;
                if members.len() >= self.config.max_peers_per_room {
                    return Err(RegistryError::RoomFull { document_id, limit: self.config.max_peers_per_room });
                }
                members.insert(token, participant.clone());
            }
            room
        };

        let (receiver, snapshot, missed) = {
            let sequencer = room.sequencer.lock().await;
            let receiver = room.broadcast.subscribe();
            let missed = last_seen_revision
                .and_then(|revision| sequencer.accepted_since(revision))
                .unwrap_or_default();
            (receiver, sequencer.snapshot(), missed)
        };

        self.sessions.write().await.insert(
            token,
            ParticipantSession {
                token,
                participant: participant.clone(),
                document_id,
                state: SessionState::Connected,
                last_seen_revision: snapshot.revision,
                last_heartbeat: Instant::now(),
            },
        );

        let participants = room.participants().await;
        let presences = room.presence.read().await.all();
        room.broadcast
            .broadcast(&SyncMessage::ParticipantJoined(participant.clone()), Some(participant.participant_id))?;

        log::info!(
            "Participant {} ({}, cursor {}) joined document {document_id} at revision {}",
            participant.display_name,
            participant.participant_id,
            participant.color,
            snapshot.revision
        );
        Ok(JoinOutcome { token, snapshot, participants, presences, missed, receiver })
    }

    /// Sequence a submission and broadcast the result.
    ///
    /// A fresh acceptance is delivered through the room broadcast (as
    /// `Accepted` to the author's session); a duplicate is returned only to
    /// the caller.
    pub async fn submit(&self, token: SessionToken, op: Operation, base_revision: u64) -> Result<Sequenced, SubmitError> {
        let session = self.session(token).await.ok_or(SubmitError::UnknownSession)?;
        if op.author() != session.participant.participant_id {
            return Err(SubmitError::UnknownSession);
        }
        let room = self.room(session.document_id).await.ok_or(SubmitError::UnknownSession)?;

        let mut sequencer = room.sequencer.lock().await;
        let sequenced = sequencer.prepare(op.with_base_revision(base_revision))?;
        let Sequenced::Accepted(accepted) = &sequenced else {
            log::debug!("Duplicate submission {} from {token}", sequenced.accepted().op.id);
            return Ok(sequenced);
        };

        let document_id = session.document_id;
        let appended = with_retry(&self.config.append_retry, || {
            let store = self.store.clone();
            let record = accepted.clone();
            async move {
                tokio::task::spawn_blocking(move || store.append(document_id, &record))
                    .await
                    .map_err(|e| StoreError::Unavailable(format!("append task failed: {e}")))?
            }
        })
        .await;
        if let Err(exhausted) = appended {
            sequencer.abort();
            log::error!("Append for document {document_id} failed: {exhausted}");
            return Err(SubmitError::Unavailable(exhausted.last_error));
        }

        sequencer.commit(accepted.clone())?;
        match Envelope::accepted(accepted, token) {
            Ok(envelope) => {
                room.broadcast.send(envelope);
            }
            Err(e) => log::error!("Failed to encode revision {}: {e}", accepted.revision),
        }
        log::debug!("Accepted {} as revision {} of {document_id}", accepted.op.id, accepted.revision);
        Ok(sequenced)
    }

    /// Remove a session. The room is dropped (after saving a snapshot) when
    /// its last member leaves.
    pub async fn leave(&self, token: SessionToken) -> Option<ParticipantSession> {
        let session = self.sessions.write().await.remove(&token)?;
        let participant_id = session.participant.participant_id;
        let document_id = session.document_id;

        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&document_id).cloned() else {
            return Some(session);
        };

        let (still_present, now_empty) = {
            let mut members = room.members.write().await;
            members.remove(&token);
            (members.values().any(|m| m.participant_id == participant_id), members.is_empty())
        };
        if !still_present {
            room.presence.write().await.remove(participant_id);
            if let Err(e) = room.broadcast.broadcast(&SyncMessage::ParticipantLeft(participant_id), Some(participant_id)) {
                log::error!("Failed to announce departure of {participant_id}: {e}");
            }
        }

        if now_empty {
            let snapshot = room.sequencer.lock().await.snapshot();
            match self.store.save_snapshot(document_id, &snapshot) {
                Ok(()) => log::info!("Persisted snapshot of {document_id} at revision {}", snapshot.revision),
                Err(e) => log::error!("Failed to persist snapshot for {document_id}: {e}"),
            }
            rooms.remove(&document_id);
            log::info!("Room {document_id} removed (empty)");
        }

        log::info!("Participant {participant_id} left document {document_id}");
        Some(session)
    }

    /// Broadcast `msg` to every member of a document except `exclude`.
    pub async fn broadcast(
        &self,
        document_id: DocumentId,
        msg: &SyncMessage,
        exclude: Option<ParticipantId>,
    ) -> Result<usize, RegistryError> {
        match self.room(document_id).await {
            Some(room) => Ok(room.broadcast.broadcast(msg, exclude)?),
            None => Ok(0),
        }
    }

    /// Record a presence update and push it to the other members.
    pub async fn update_presence(&self, token: SessionToken, mut presence: Presence) -> Result<Presence, RegistryError> {
        let session = self.session(token).await.ok_or(RegistryError::UnknownSession(token))?;
        let room = self.room(session.document_id).await.ok_or(RegistryError::UnknownSession(token))?;

        presence.participant_id = session.participant.participant_id;
        let stamped = room.presence.write().await.update(presence);
        room.broadcast
            .broadcast(&SyncMessage::PresenceUpdate(stamped.clone()), Some(stamped.participant_id))?;
        log::trace!("Presence of {} at {}", stamped.participant_id, stamped.cursor_offset);
        Ok(stamped)
    }

    /// Heartbeat received.
    pub async fn touch(&self, token: SessionToken) -> bool {
        match self.sessions.write().await.get_mut(&token) {
            Some(session) => {
                session.last_heartbeat = Instant::now();
                session.state = SessionState::Connected;
                true
            }
            None => false,
        }
    }

    pub async fn mark_disconnected(&self, token: SessionToken) {
        if let Some(session) = self.sessions.write().await.get_mut(&token) {
            session.state = SessionState::Disconnected;
        }
    }

    /// An accepted revision was written to the session's connection.
    pub async fn note_delivered(&self, token: SessionToken, revision: u64) {
        if let Some(session) = self.sessions.write().await.get_mut(&token) {
            session.last_seen_revision = session.last_seen_revision.max(revision);
        }
    }

    /// A session's receiver lagged and lost `n` messages.
    pub async fn note_dropped(&self, document_id: DocumentId, n: u64) {
        if let Some(room) = self.room(document_id).await {
            room.broadcast.note_dropped(n);
        }
    }

    pub async fn participants(&self, document_id: DocumentId) -> Vec<ParticipantInfo> {
        match self.room(document_id).await {
            Some(room) => room.participants().await,
            None => Vec::new(),
        }
    }

    pub async fn session(&self, token: SessionToken) -> Option<ParticipantSession> {
        self.sessions.read().await.get(&token).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Current snapshot of a loaded document.
    pub async fn snapshot(&self, document_id: DocumentId) -> Option<Snapshot> {
        let room = self.room(document_id).await?;
        let snapshot = room.sequencer.lock().await.snapshot();
        Some(snapshot)
    }

    pub async fn broadcast_stats(&self, document_id: DocumentId) -> Option<BroadcastStats> {
        self.room(document_id).await.map(|room| room.broadcast.stats())
    }

    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    async fn room(&self, document_id: DocumentId) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(&document_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use tandem_core::OpId;
    use uuid::Uuid;

    fn registry_with(store: Arc<MemoryStore>) -> SessionRegistry {
        let config = RegistryConfig { append_retry: RetryPolicy::for_testing(), ..RegistryConfig::default() };
        SessionRegistry::new(store, config)
    }

    fn registry() -> SessionRegistry {
        registry_with(Arc::new(MemoryStore::new()))
    }

    /// Appends that block the calling thread for a while.
    struct SlowStore {
        inner: MemoryStore,
        delay: std::time::Duration,
    }

    impl OperationStore for SlowStore {
        fn append(&self, document_id: DocumentId, accepted: &AcceptedOperation) -> Result<(), StoreError> {
            std::thread::sleep(self.delay);
            self.inner.append(document_id, accepted)
        }

        fn read_from(&self, document_id: DocumentId, from_revision: u64) -> Result<Vec<AcceptedOperation>, StoreError> {
            self.inner.read_from(document_id, from_revision)
        }

        fn load_snapshot(&self, document_id: DocumentId) -> Result<Option<Snapshot>, StoreError> {
            self.inner.load_snapshot(document_id)
        }

        fn save_snapshot(&self, document_id: DocumentId, snapshot: &Snapshot) -> Result<(), StoreError> {
            self.inner.save_snapshot(document_id, snapshot)
        }

        fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
            self.inner.list_documents()
        }
    }

    fn decode(envelope: &Envelope, token: SessionToken, participant: ParticipantId) -> Option<SyncMessage> {
        envelope.for_session(token, participant).map(|bytes| SyncMessage::decode(bytes).unwrap())
    }

    /// Next message this session would actually forward.
    async fn next_visible(outcome: &mut JoinOutcome, participant: ParticipantId) -> SyncMessage {
        loop {
            let envelope = outcome.receiver.recv().await.unwrap();
            if let Some(msg) = decode(&envelope, outcome.token, participant) {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_join_returns_snapshot_and_roster() {
        let registry = registry();
        let doc = Uuid::new_v4();
        let alice = ParticipantInfo::random("Alice");
        let outcome = registry.join(doc, alice.clone(), None).await.unwrap();
        assert_eq!(outcome.snapshot.revision, 0);
        assert_eq!(outcome.participants, vec![alice]);
        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_joined_announced_to_others() {
        let registry = registry();
        let doc = Uuid::new_v4();
        let alice = ParticipantInfo::random("Alice");
        let mut first = registry.join(doc, alice.clone(), None).await.unwrap();
        let bob = ParticipantInfo::random("Bob");
        registry.join(doc, bob.clone(), None).await.unwrap();

        match next_visible(&mut first, alice.participant_id).await {
            SyncMessage::ParticipantJoined(info) => assert_eq!(info, bob),
            other => panic!("expected ParticipantJoined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_broadcasts_in_order() {
        let registry = registry();
        let doc = Uuid::new_v4();
        let alice = ParticipantInfo::random("Alice");
        let bob = ParticipantInfo::random("Bob");
        let a = registry.join(doc, alice.clone(), None).await.unwrap();
        let mut b = registry.join(doc, bob.clone(), None).await.unwrap();

        for seq in 1..=3 {
            let op = Operation::insert(OpId::new(alice.participant_id, seq), doc, seq - 1, 0, "x");
            registry.submit(a.token, op, seq - 1).await.unwrap();
        }

        let mut revisions = Vec::new();
        while revisions.len() < 3 {
            let envelope = b.receiver.recv().await.unwrap();
            if let Some(SyncMessage::Broadcast(accepted)) = decode(&envelope, b.token, bob.participant_id) {
                revisions.push(accepted.revision);
            }
        }
        assert_eq!(revisions, vec![1, 2, 3]);
        assert_eq!(registry.snapshot(doc).await.unwrap().content, "xxx");
    }

    #[tokio::test]
    async fn test_author_receives_accepted() {
        let registry = registry();
        let doc = Uuid::new_v4();
        let alice = ParticipantInfo::random("Alice");
        let mut a = registry.join(doc, alice.clone(), None).await.unwrap();
        let op = Operation::insert(OpId::new(alice.participant_id, 1), doc, 0, 0, "hi");
        registry.submit(a.token, op.clone(), 0).await.unwrap();

        match next_visible(&mut a, alice.participant_id).await {
            SyncMessage::Accepted(accepted) => assert_eq!(accepted.op.id, op.id),
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_unknown_session() {
        let registry = registry();
        let op = Operation::insert(OpId::new(Uuid::new_v4(), 1), Uuid::new_v4(), 0, 0, "x");
        let err = registry.submit(SessionToken::generate(), op, 0).await.unwrap_err();
        assert!(matches!(err, SubmitError::UnknownSession));
    }

    #[tokio::test]
    async fn test_submit_as_other_author_refused() {
        let registry = registry();
        let doc = Uuid::new_v4();
        let a = registry.join(doc, ParticipantInfo::random("Alice"), None).await.unwrap();
        let op = Operation::insert(OpId::new(Uuid::new_v4(), 1), doc, 0, 0, "x");
        assert!(matches!(registry.submit(a.token, op, 0).await, Err(SubmitError::UnknownSession)));
    }

    #[tokio::test]
    async fn test_append_retried_then_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(store.clone());
        let doc = Uuid::new_v4();
        let alice = ParticipantInfo::random("Alice");
        let a = registry.join(doc, alice.clone(), None).await.unwrap();

        // Two failures are absorbed by the retry policy.
        store.fail_next_appends(2);
        let op = Operation::insert(OpId::new(alice.participant_id, 1), doc, 0, 0, "a");
        assert!(registry.submit(a.token, op, 0).await.is_ok());

        store.set_unavailable(true);
        let op = Operation::insert(OpId::new(alice.participant_id, 2), doc, 1, 0, "b");
        let err = registry.submit(a.token, op.clone(), 1).await.unwrap_err();
        assert!(matches!(err, SubmitError::Unavailable(_)));
        assert_eq!(registry.snapshot(doc).await.unwrap().revision, 1);

        store.set_unavailable(false);
        assert!(matches!(registry.submit(a.token, op, 1).await, Ok(Sequenced::Accepted(_))));
    }

    #[tokio::test]
    async fn test_rejoin_gets_missed() {
        let registry = registry();
        let doc = Uuid::new_v4();
        let alice = ParticipantInfo::random("Alice");
        let keeper = registry.join(doc, ParticipantInfo::random("Keeper"), None).await.unwrap();
        let a = registry.join(doc, alice.clone(), None).await.unwrap();
        for seq in 1..=3 {
            let op = Operation::insert(OpId::new(alice.participant_id, seq), doc, seq - 1, 0, "x");
            registry.submit(a.token, op, seq - 1).await.unwrap();
        }
        registry.leave(a.token).await.unwrap();

        let again = registry.join(doc, alice, Some(1)).await.unwrap();
        assert_eq!(again.missed.iter().map(|m| m.revision).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(again.snapshot.revision, 3);
        drop(keeper);
    }

    #[tokio::test]
    async fn test_last_leave_persists_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(store.clone());
        let doc = Uuid::new_v4();
        let alice = ParticipantInfo::random("Alice");
        let a = registry.join(doc, alice.clone(), None).await.unwrap();
        let op = Operation::insert(OpId::new(alice.participant_id, 1), doc, 0, 0, "kept");
        registry.submit(a.token, op, 0).await.unwrap();

        registry.leave(a.token).await.unwrap();
        assert_eq!(registry.room_count().await, 0);
        assert_eq!(store.load_snapshot(doc).unwrap().unwrap().content, "kept");

        // Reloaded from the store on the next join.
        let again = registry.join(doc, alice, None).await.unwrap();
        assert_eq!(again.snapshot.content, "kept");
        assert_eq!(again.snapshot.revision, 1);
    }

    #[tokio::test]
    async fn test_presence_excludes_author() {
        let registry = registry();
        let doc = Uuid::new_v4();
        let alice = ParticipantInfo::random("Alice");
        let bob = ParticipantInfo::random("Bob");
        let mut a = registry.join(doc, alice.clone(), None).await.unwrap();
        let mut b = registry.join(doc, bob.clone(), None).await.unwrap();

        let stamped = registry.update_presence(a.token, Presence::at(alice.participant_id, 4)).await.unwrap();
        assert!(stamped.updated_at > 0);

        match next_visible(&mut b, bob.participant_id).await {
            SyncMessage::PresenceUpdate(p) => assert_eq!(p.cursor_offset, 4),
            other => panic!("expected PresenceUpdate, got {other:?}"),
        }

        let c = registry.join(doc, ParticipantInfo::random("Carol"), None).await.unwrap();
        assert_eq!(c.presences.len(), 1);
    }

    #[tokio::test]
    async fn test_room_full() {
        let store = Arc::new(MemoryStore::new());
        let config = RegistryConfig { max_peers_per_room: 1, ..RegistryConfig::default() };
        let registry = SessionRegistry::new(store, config);
        let doc = Uuid::new_v4();
        registry.join(doc, ParticipantInfo::random("A"), None).await.unwrap();
        let err = registry.join(doc, ParticipantInfo::random("B"), None).await.err().unwrap();
        assert!(matches!(err, RegistryError::RoomFull { limit: 1, .. }));
    }

    #[tokio::test]
    async fn test_touch_and_delivery_tracking() {
        let registry = registry();
        let a = registry.join(Uuid::new_v4(), ParticipantInfo::random("A"), None).await.unwrap();
        assert!(registry.touch(a.token).await);
        assert!(!registry.touch(SessionToken::generate()).await);
        registry.note_delivered(a.token, 5).await;
        registry.note_delivered(a.token, 3).await;
        assert_eq!(registry.session(a.token).await.unwrap().last_seen_revision, 5);
    }

    #[tokio::test]
    async fn test_slow_append_keeps_runtime_responsive() {
        let store = Arc::new(SlowStore { inner: MemoryStore::new(), delay: std::time::Duration::from_millis(300) });
        let config = RegistryConfig { append_retry: RetryPolicy::for_testing(), ..RegistryConfig::default() };
        let registry = Arc::new(SessionRegistry::new(store, config));
        let doc = Uuid::new_v4();
        let alice = ParticipantInfo::random("Alice");
        let outcome = registry.join(doc, alice.clone(), None).await.unwrap();
        let token = outcome.token;

        let op = Operation::insert(OpId::new(alice.participant_id, 1), doc, 0, 0, "slow");
        let submitting = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.submit(token, op, 0).await })
        };

        // Single-threaded runtime: this timer only fires on time if the
        // append is off the worker thread.
        let started = Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(started.elapsed() < std::time::Duration::from_millis(250));

        assert!(submitting.await.unwrap().is_ok());
        assert_eq!(registry.snapshot(doc).await.unwrap().content, "slow");
    }
}
