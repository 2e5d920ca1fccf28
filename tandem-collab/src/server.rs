//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐                         ┌── Sequencer ── OperationStore
//!            ├── SessionRegistry ── Room                 (RocksDB / memory)
//! Client B ──┘                         └── BroadcastGroup
//!                                              │
//!                               ┌──────────────┼──────────────┐
//!                               ▼              ▼              ▼
//!                           Client A       Client B       Client C
//! ```
//!
//! One task per connection. Each task selects over the socket, its room's
//! broadcast receiver and a heartbeat watchdog. A connection that goes
//! silent for `heartbeat_interval_secs * missed_heartbeat_limit` is treated
//! as gone and its session is removed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tandem_core::{DocumentId, ParticipantId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::Envelope;
use crate::protocol::{RejectReason, SessionToken, SyncMessage};
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::retry::RetryPolicy;
use crate::sequencer::Sequenced;
use crate::storage::{MemoryStore, OperationStore, RocksStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sessions per document
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Expected client heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Missed heartbeats before a session times out
    pub missed_heartbeat_limit: u32,
    /// RocksDB path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Retries for durable appends before answering `SequencerUnavailable`
    pub append_retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            missed_heartbeat_limit: 3,
            storage_path: None,
            append_retry: RetryPolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 10,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 1,
            missed_heartbeat_limit: 3,
            storage_path: None,
            append_retry: RetryPolicy::for_testing(),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1) * u64::from(self.missed_heartbeat_limit.max(1)))
    }

    fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            broadcast_capacity: self.broadcast_capacity,
            max_peers_per_room: self.max_peers_per_room,
            append_retry: self.append_retry.clone(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub accepted_operations: u64,
    pub duplicate_operations: u64,
    pub rejected_operations: u64,
    pub heartbeat_timeouts: u64,
    pub active_rooms: usize,
    pub active_sessions: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// In-memory server.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Server over the given store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn OperationStore>) -> Self {
        let registry = Arc::new(SessionRegistry::new(store, config.registry_config()));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Server persisting to RocksDB when `storage_path` is set, in memory
    /// otherwise.
    pub fn open(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn OperationStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig { path: path.clone(), ..StoreConfig::default() })?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Load persisted documents so they are ready before peers reconnect.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        self.registry.recover_all().await
    }

    /// Bind `bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection {
            addr,
            registry: registry.clone(),
            stats: stats.clone(),
            session: None,
        };
        let result = conn.run(ws_stream, &config).await;

        if let Some(session) = conn.session.take() {
            registry.leave(session.token).await;
        }
        stats.write().await.active_connections -= 1;
        result
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats.active_sessions = self.registry.session_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

struct JoinedSession {
    token: SessionToken,
    participant_id: ParticipantId,
    document_id: DocumentId,
}

/// Per-connection state. Whatever `run` returns, the caller removes the
/// joined session afterwards.
struct Connection {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
    session: Option<JoinedSession>,
}

enum Flow {
    Continue,
    Close,
}

impl Connection {
    async fn run(&mut self, ws_stream: WebSocketStream<TcpStream>, config: &ServerConfig) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Envelope>>> = None;

        let timeout = config.heartbeat_timeout();
        let mut last_heard = Instant::now();
        let mut watchdog = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            last_heard = Instant::now();
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match SyncMessage::decode(&bytes) {
                                Ok(sync_msg) => {
                                    if let Flow::Close = self.handle_message(sync_msg, &mut ws_sender, &mut broadcast_rx).await? {
                                        break;
                                    }
                                }
                                Err(e) => log::warn!("Failed to decode message from {}: {e}", self.addr),
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {}", self.addr);
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            last_heard = Instant::now();
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", self.addr);
                            break;
                        }

                        _ => {}
                    }
                }

                envelope = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match envelope {
                        Ok(envelope) => self.forward(&envelope, &mut ws_sender).await?,
                        Err(RecvError::Lagged(n)) => {
                            // Lost messages cannot be re-sent from here; the
                            // client rejoins and replays from its last revision.
                            log::warn!("Connection {} lagged by {n} messages, closing", self.addr);
                            if let Some(session) = &self.session {
                                self.registry.note_dropped(session.document_id, n).await;
                            }
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = watchdog.tick() => {
                    if last_heard.elapsed() > timeout {
                        log::warn!("Heartbeat timeout for {} after {timeout:?}", self.addr);
                        self.stats.write().await.heartbeat_timeouts += 1;
                        if let Some(session) = &self.session {
                            self.registry.mark_disconnected(session.token).await;
                        }
                        break;
                    }
                }
            }
        }

        // Best effort; the peer may already be gone.
        let _ = ws_sender.close().await;
        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: SyncMessage,
        ws_sender: &mut WsSender,
        broadcast_rx: &mut Option<broadcast::Receiver<Arc<Envelope>>>,
    ) -> Result<Flow, BoxError> {
        match msg {
            SyncMessage::Join { document_id, participant, last_seen_revision } => {
                if self.session.is_some() {
                    log::warn!("Second Join on connection {} ignored", self.addr);
                    return Ok(Flow::Continue);
                }
                let participant_id = participant.participant_id;
                match self.registry.join(document_id, participant, last_seen_revision).await {
                    Ok(outcome) => {
                        send(ws_sender, &outcome.ack()).await?;
                        self.session = Some(JoinedSession { token: outcome.token, participant_id, document_id });
                        *broadcast_rx = Some(outcome.receiver);
                    }
                    Err(e) => {
                        log::warn!("Join of {participant_id} to {document_id} refused: {e}");
                        return Ok(Flow::Close);
                    }
                }
            }

            SyncMessage::Submit { session_token, op, base_revision } => {
                let op_id = op.id;
                let joined = self.session.as_ref().map(|s| s.token);
                if joined != Some(session_token) {
                    send(ws_sender, &SyncMessage::Rejected { op_id, reason: RejectReason::UnknownSession }).await?;
                    return Ok(Flow::Continue);
                }
                match self.registry.submit(session_token, op, base_revision).await {
                    Ok(Sequenced::Accepted(_)) => {
                        // Delivered to this connection through the room broadcast.
                        self.stats.write().await.accepted_operations += 1;
                    }
                    Ok(Sequenced::Duplicate(original)) => {
                        self.stats.write().await.duplicate_operations += 1;
                        send(ws_sender, &SyncMessage::Accepted(original)).await?;
                    }
                    Err(e) => {
                        log::warn!("Rejected {op_id} from {}: {e}", self.addr);
                        self.stats.write().await.rejected_operations += 1;
                        send(ws_sender, &SyncMessage::Rejected { op_id, reason: e.reason() }).await?;
                    }
                }
            }

            SyncMessage::PresenceUpdate(presence) => {
                if let Some(session) = &self.session {
                    if let Err(e) = self.registry.update_presence(session.token, presence).await {
                        log::debug!("Presence update from {} dropped: {e}", self.addr);
                    }
                }
            }

            SyncMessage::Heartbeat => {
                if let Some(session) = &self.session {
                    self.registry.touch(session.token).await;
                }
                send(ws_sender, &SyncMessage::HeartbeatAck).await?;
            }

            SyncMessage::Leave { session_token } => {
                if self.session.as_ref().map(|s| s.token) == Some(session_token) {
                    log::info!("Session {session_token} left");
                    return Ok(Flow::Close);
                }
            }

            other => {
                log::debug!("Unexpected {} from {}", other.kind(), self.addr);
            }
        }
        Ok(Flow::Continue)
    }

    async fn forward(&self, envelope: &Envelope, ws_sender: &mut WsSender) -> Result<(), BoxError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        if let Some(bytes) = envelope.for_session(session.token, session.participant_id) {
            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
            if let Some(revision) = envelope.revision() {
                self.registry.note_delivered(session.token, revision).await;
            }
        }
        Ok(())
    }
}

async fn send(ws_sender: &mut WsSender, msg: &SyncMessage) -> Result<(), BoxError> {
    let encoded = msg.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}
