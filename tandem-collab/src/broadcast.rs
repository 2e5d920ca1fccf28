//! Per-document fan-out.
//!
//! One tokio broadcast channel per document room. Messages are encoded once
//! and shared as `Arc<Envelope>`; each connection decides from the envelope
//! whether and what to forward, so every member observes the same order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use tandem_core::{AcceptedOperation, ParticipantId};

use crate::protocol::{ProtocolError, SessionToken, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

/// One broadcast item.
#[derive(Debug)]
pub struct Envelope {
    /// Encoded message for ordinary members
    payload: Vec<u8>,
    /// Participant that must not receive `payload`
    exclude: Option<ParticipantId>,
    /// Session that receives a different message in the same slot
    direct: Option<(SessionToken, Vec<u8>)>,
    /// Revision carried, for delivery tracking
    revision: Option<u64>,
}

impl Envelope {
    pub fn new(msg: &SyncMessage, exclude: Option<ParticipantId>) -> Result<Self, ProtocolError> {
        Ok(Self { payload: msg.encode()?, exclude, direct: None, revision: None })
    }

    /// `Broadcast` for everyone, `Accepted` for the author's session.
    pub fn accepted(accepted: &AcceptedOperation, author_session: SessionToken) -> Result<Self, ProtocolError> {
        let payload = SyncMessage::Broadcast(accepted.clone()).encode()?;
        let direct = SyncMessage::Accepted(accepted.clone()).encode()?;
        Ok(Self {
            payload,
            exclude: None,
            direct: Some((author_session, direct)),
            revision: Some(accepted.revision),
        })
    }

    /// Bytes to forward to `session` of `participant`, if any.
    pub fn for_session(&self, session: SessionToken, participant: ParticipantId) -> Option<&[u8]> {
        if let Some((token, bytes)) = &self.direct {
            if *token == session {
                return Some(bytes);
            }
        }
        if self.exclude == Some(participant) {
            return None;
        }
        Some(&self.payload)
    }

    pub fn revision(&self) -> Option<u64> {
        self.revision
    }
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a slow receiver may lag before it starts
    /// losing messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }

    /// Encode and send `msg` to every subscriber except `exclude`.
    pub fn broadcast(&self, msg: &SyncMessage, exclude: Option<ParticipantId>) -> Result<usize, ProtocolError> {
        Ok(self.send(Envelope::new(msg, exclude)?))
    }

    /// Send a prepared envelope. Returns the number of receivers.
    pub fn send(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(Arc::new(envelope)).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record messages a receiver lost to lag.
    pub fn note_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}
