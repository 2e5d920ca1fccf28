//! Binary wire protocol.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`SyncMessage`].
//!
//! ```text
//! client                                   server
//!   │ Join{doc, participant, lastSeen?} ──►  │
//!   │ ◄── JoinAck{snapshot, token, missed}   │
//!   │ Submit{token, op, base} ────────────►  │
//!   │ ◄── Accepted{op', rev} | Rejected      │   other members: Broadcast{op', rev}
//!   │ PresenceUpdate ─────────────────────►  │   ──► PresenceUpdate (stamped)
//!   │ Heartbeat ──────────────────────────►  │
//!   │ ◄── HeartbeatAck                       │
//!   │ Leave{token} ───────────────────────►  │
//! ```

use serde::{Deserialize, Serialize};
use tandem_core::{AcceptedOperation, DocumentId, OpId, Operation, ParticipantId, Snapshot};
use uuid::Uuid;

use crate::presence::CursorColor;

/// Opaque handle for a joined participant session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(pub Uuid);

impl SessionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Participant identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantInfo {
    pub participant_id: ParticipantId,
    pub display_name: String,
    /// Stable cursor color derived from the participant id
    pub color: CursorColor,
}

impl ParticipantInfo {
    pub fn new(participant_id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            participant_id,
            display_name: display_name.into(),
            color: CursorColor::from_uuid(participant_id),
        }
    }

    /// Fresh random identity (for demos and tests).
    pub fn random(display_name: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4(), display_name)
    }
}

/// Cursor and selection of one participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Presence {
    pub participant_id: ParticipantId,
    /// Character offset of the caret
    pub cursor_offset: usize,
    /// Selected `[start, end)` character range
    pub selection: Option<(usize, usize)>,
    /// File the participant currently has focused
    pub active_file: Option<String>,
    /// Server receive time, ms since the Unix epoch (zero until stamped)
    pub updated_at: u64,
}

impl Presence {
    pub fn at(participant_id: ParticipantId, cursor_offset: usize) -> Self {
        Self {
            participant_id,
            cursor_offset,
            selection: None,
            active_file: None,
            updated_at: 0,
        }
    }
}

/// Why a submission was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Base revision ahead of the server; resync then resubmit
    StaleSubmission,
    /// Operation does not fit the document after transformation
    InvalidRange,
    /// Durable append failed after retries; retry later
    SequencerUnavailable,
    /// Session token not recognised; rejoin
    UnknownSession,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::StaleSubmission => "stale submission",
            RejectReason::InvalidRange => "invalid range",
            RejectReason::SequencerUnavailable => "sequencer unavailable",
            RejectReason::UnknownSession => "unknown session",
        };
        f.write_str(s)
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    Join {
        document_id: DocumentId,
        participant: ParticipantInfo,
        /// Last revision the client confirmed, when rejoining
        last_seen_revision: Option<u64>,
    },
    JoinAck {
        snapshot: Snapshot,
        revision: u64,
        session_token: SessionToken,
        participants: Vec<ParticipantInfo>,
        presences: Vec<Presence>,
        /// Accepted operations after `last_seen_revision`
        missed: Vec<AcceptedOperation>,
    },
    Submit {
        session_token: SessionToken,
        op: Operation,
        base_revision: u64,
    },
    /// Sent to the author of an accepted operation.
    Accepted(AcceptedOperation),
    Rejected {
        op_id: OpId,
        reason: RejectReason,
    },
    /// Sent to every other member of the document.
    Broadcast(AcceptedOperation),
    PresenceUpdate(Presence),
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft(ParticipantId),
    Heartbeat,
    HeartbeatAck,
    Leave {
        session_token: SessionToken,
    },
}

impl SyncMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Join { .. } => "Join",
            SyncMessage::JoinAck { .. } => "JoinAck",
            SyncMessage::Submit { .. } => "Submit",
            SyncMessage::Accepted(_) => "Accepted",
            SyncMessage::Rejected { .. } => "Rejected",
            SyncMessage::Broadcast(_) => "Broadcast",
            SyncMessage::PresenceUpdate(_) => "PresenceUpdate",
            SyncMessage::ParticipantJoined(_) => "ParticipantJoined",
            SyncMessage::ParticipantLeft(_) => "ParticipantLeft",
            SyncMessage::Heartbeat => "Heartbeat",
            SyncMessage::HeartbeatAck => "HeartbeatAck",
            SyncMessage::Leave { .. } => "Leave",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A message arrived that is not valid in the current state
    UnexpectedMessage(&'static str),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedMessage(kind) => write!(f, "Unexpected message: {kind}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
