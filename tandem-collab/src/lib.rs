//! # tandem-collab: Real-time sync engine for Tandem
//!
//! Server-authoritative operational transformation over WebSocket. Every
//! document has one sequencer that orders submissions, persists them and
//! fans them out; clients keep an optimistic replica and rebase their
//! pending edits through whatever the server accepts first.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐    WebSocket     ┌────────────────┐
//! │ ConnectionManager │ ◄──────────────► │   SyncServer   │
//! │  (per user)       │   Binary Proto   │   (central)    │
//! └─────────┬─────────┘                  └───────┬────────┘
//!           │                                    │
//!           ▼                                    ▼
//! ┌───────────────────┐                  ┌────────────────┐
//! │ Replica           │                  │ SessionRegistry│
//! │ (optimistic view) │                  │  ├ Sequencer   │──► OperationStore
//! └───────────────────┘                  │  └ Broadcast   │
//!                                        └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`sequencer`]: Per-document total order and transformation
//! - [`registry`]: Sessions, rooms, acceptance pipeline
//! - [`broadcast`]: Room fan-out
//! - [`replica`]: Client-side pending queue and rebasing
//! - [`conflict`]: Surfacing edits whose intent was altered
//! - [`presence`]: Cursors and selections
//! - [`storage`]: Durable operation log and snapshots (RocksDB)
//! - [`retry`]: Append retries and reconnect backoff
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket connection manager

pub mod broadcast;
pub mod client;
pub mod conflict;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod retry;
pub mod sequencer;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use client::{ClientConfig, ClientError, ConnectionManager, ConnectionState, SyncEvent};
pub use conflict::{Conflict, ConflictSet, Resolution};
pub use presence::{CursorColor, PresenceRoom, PresenceTracker, RemotePeer};
pub use protocol::{ParticipantInfo, Presence, ProtocolError, RejectReason, SessionToken, SyncMessage};
pub use registry::{JoinOutcome, ParticipantSession, SessionState, RegistryConfig, RegistryError, SessionRegistry};
pub use replica::{Replica, ReplicaError, ReplicaEvent};
pub use retry::{with_retry, Backoff, RetryExhausted, RetryPolicy};
pub use sequencer::{Sequenced, Sequencer, SequencerState, SubmitError};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{DocumentMetadata, MemoryStore, OperationStore, RocksStore, StoreConfig, StoreError};
