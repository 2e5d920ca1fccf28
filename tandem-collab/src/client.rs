//! WebSocket connection manager for one document.
//!
//! Provides:
//! - Connection lifecycle (connect, heartbeat, reconnect with backoff)
//! - Submission of local edits, one operation in flight at a time
//! - Replay of missed operations after a reconnect
//! - Presence (cursor/selection) updates, dropped while offline
//!
//! Edits made while disconnected stay queued in the [`Replica`] and are
//! submitted once the next session is joined.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_core::{DocumentId, OpId, Operation, ParticipantId};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;

use crate::conflict::{Conflict, Resolution};
use crate::presence::{PresenceRoom, RemotePeer};
use crate::protocol::{ParticipantInfo, Presence, ProtocolError, SessionToken, SyncMessage};
use crate::replica::{Replica, ReplicaError, ReplicaEvent};
use crate::retry::Backoff;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub heartbeat_interval: Duration,
    /// Unanswered heartbeats before the connection is considered lost
    pub missed_heartbeat_limit: u32,
    /// Reconnect pacing, also used to space deferred resubmissions
    pub backoff: Backoff,
    pub join_timeout: Duration,
    pub outgoing_capacity: usize,
    pub event_capacity: usize,
    /// Minimum interval between presence updates
    pub presence_interval: Duration,
    /// Remote cursors unchanged for this long are dropped
    pub presence_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            missed_heartbeat_limit: 3,
            backoff: Backoff::default(),
            join_timeout: Duration::from_secs(10),
            outgoing_capacity: 256,
            event_capacity: 256,
            presence_interval: Duration::from_millis(33),
            presence_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(200),
            missed_heartbeat_limit: 3,
            backoff: Backoff::for_testing(),
            join_timeout: Duration::from_secs(2),
            outgoing_capacity: 64,
            event_capacity: 1024,
            presence_interval: Duration::ZERO,
            presence_idle_timeout: Duration::from_secs(5),
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or waiting to reconnect
    Disconnected,
    Connecting,
    /// Joined; submissions and presence flow
    Connected,
    /// `close` was called
    Closed,
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Session joined at this revision
    Connected { revision: u64 },
    /// Connection lost; edits keep queueing
    Disconnected,
    /// A remote operation, as applied to the local text
    RemoteOp(Operation),
    /// A local operation was sequenced
    Acknowledged { op_id: OpId, revision: u64 },
    Conflict(Conflict),
    /// A local operation was refused and removed from the text
    Discarded(Operation),
    /// Text rebuilt from a server snapshot
    Reset { revision: u64 },
    PresenceChanged(Presence),
    /// A remote cursor went idle and was dropped
    PresenceExpired(ParticipantId),
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft(ParticipantId),
    Closed,
}

#[derive(Debug)]
pub enum ClientError {
    Replica(ReplicaError),
    Protocol(ProtocolError),
    /// The manager was closed
    Closed,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Replica(e) => write!(f, "{e}"),
            ClientError::Protocol(e) => write!(f, "{e}"),
            ClientError::Closed => write!(f, "Connection manager closed"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ReplicaError> for ClientError {
    fn from(e: ReplicaError) -> Self {
        ClientError::Replica(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

enum Command {
    /// Submit the next queued operation if nothing is in flight
    Flush,
    Presence(Presence),
    Close,
}

struct Shared {
    replica: Mutex<Replica>,
    presence: Mutex<PresenceRoom>,
    state: RwLock<ConnectionState>,
}

/// Keeps one participant's replica of one document in sync with the server.
pub struct ConnectionManager {
    info: ParticipantInfo,
    document_id: DocumentId,
    url: String,
    config: ClientConfig,
    shared: Arc<Shared>,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: Option<mpsc::UnboundedReceiver<Command>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    supervisor: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(info: ParticipantInfo, document_id: DocumentId, url: impl Into<String>, config: ClientConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let presence = PresenceRoom::with_interval(info.participant_id, config.presence_interval)
            .with_idle_timeout(config.presence_idle_timeout);
        let shared = Arc::new(Shared {
            replica: Mutex::new(Replica::new(info.participant_id, document_id)),
            presence: Mutex::new(presence),
            state: RwLock::new(ConnectionState::Disconnected),
        });
        Self {
            info,
            document_id,
            url: url.into(),
            config,
            shared,
            command_tx,
            command_rx: Some(command_rx),
            event_tx,
            event_rx: Some(event_rx),
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Start the background task that connects, and reconnects until
    /// [`close`](Self::close).
    pub fn connect(&mut self) -> Result<(), ClientError> {
        let commands = self.command_rx.take().ok_or(ClientError::Closed)?;
        let supervisor = Supervisor {
            info: self.info.clone(),
            document_id: self.document_id,
            url: self.url.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            event_tx: self.event_tx.clone(),
        };
        self.supervisor = Some(tokio::spawn(supervisor.run(commands)));
        Ok(())
    }

    pub async fn insert(&self, position: usize, text: &str) -> Result<Operation, ClientError> {
        let op = self.shared.replica.lock().await.insert(position, text)?;
        self.after_local_edit(&op).await;
        Ok(op)
    }

    pub async fn delete(&self, position: usize, length: usize) -> Result<Operation, ClientError> {
        let op = self.shared.replica.lock().await.delete(position, length)?;
        self.after_local_edit(&op).await;
        Ok(op)
    }

    pub async fn replace(&self, position: usize, length: usize, text: &str) -> Result<Operation, ClientError> {
        let op = self.shared.replica.lock().await.replace(position, length, text)?;
        self.after_local_edit(&op).await;
        Ok(op)
    }

    async fn after_local_edit(&self, op: &Operation) {
        self.shared.presence.lock().await.rebase(op);
        // A closed supervisor leaves the edit queued in the replica.
        let _ = self.command_tx.send(Command::Flush);
    }

    /// Publish the local caret. Returns whether an update was sent; updates
    /// are dropped while not connected and throttled while connected.
    pub async fn update_cursor(&self, cursor_offset: usize, selection: Option<(usize, usize)>) -> bool {
        let update = self.shared.presence.lock().await.update_local(cursor_offset, selection);
        if self.state().await != ConnectionState::Connected {
            return false;
        }
        match update {
            Some(presence) => self.command_tx.send(Command::Presence(presence)).is_ok(),
            None => false,
        }
    }

    /// Announce which file this participant has open. Not throttled.
    pub async fn set_active_file(&self, file: Option<String>) -> bool {
        let presence = self.shared.presence.lock().await.set_active_file(file);
        if self.state().await != ConnectionState::Connected {
            return false;
        }
        self.command_tx.send(Command::Presence(presence)).is_ok()
    }

    /// Resolve an open conflict. Any replacement is submitted like a local
    /// edit.
    pub async fn resolve(&self, conflict_id: u64, resolution: Resolution) -> Result<Option<Operation>, ClientError> {
        let op = self.shared.replica.lock().await.resolve(conflict_id, resolution)?;
        if let Some(op) = &op {
            self.after_local_edit(op).await;
        }
        Ok(op)
    }

    /// Leave the session and stop reconnecting.
    pub async fn close(&mut self) {
        let _ = self.command_tx.send(Command::Close);
        if let Some(handle) = self.supervisor.take() {
            if let Err(e) = handle.await {
                log::error!("Connection supervisor failed: {e}");
            }
        }
        *self.shared.state.write().await = ConnectionState::Closed;
    }

    pub async fn text(&self) -> String {
        self.shared.replica.lock().await.text()
    }

    /// Last revision confirmed by the server.
    pub async fn revision(&self) -> u64 {
        self.shared.replica.lock().await.revision()
    }

    pub async fn conflicts(&self) -> Vec<Conflict> {
        self.shared.replica.lock().await.conflicts().to_vec()
    }

    pub async fn pending_len(&self) -> usize {
        self.shared.replica.lock().await.pending_len()
    }

    pub async fn is_synced(&self) -> bool {
        self.shared.replica.lock().await.is_synced()
    }

    pub async fn peers(&self) -> Vec<RemotePeer> {
        self.shared.presence.lock().await.peers().cloned().collect()
    }

    pub async fn local_presence(&self) -> Presence {
        self.shared.presence.lock().await.local().clone()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn participant(&self) -> &ParticipantInfo {
        &self.info
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.url
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

/// How a session ended.
enum SessionEnd {
    /// Reconnect after backoff
    Lost { joined: bool },
    /// Rejoin right away to resynchronise
    Resync,
    Closed,
}

struct Supervisor {
    info: ParticipantInfo,
    document_id: DocumentId,
    url: String,
    config: ClientConfig,
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl Supervisor {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting).await;
            let end = match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => self.session(ws_stream, &mut commands).await,
                Err(e) => {
                    log::warn!("Connecting to {} failed: {e}", self.url);
                    SessionEnd::Lost { joined: false }
                }
            };

            let was_connected = *self.shared.state.read().await == ConnectionState::Connected;
            self.set_state(ConnectionState::Disconnected).await;
            if was_connected {
                emit(&self.event_tx, SyncEvent::Disconnected);
            }

            let delay = match end {
                SessionEnd::Closed => break,
                SessionEnd::Resync => {
                    attempt = 0;
                    continue;
                }
                SessionEnd::Lost { joined } => {
                    if joined {
                        attempt = 0;
                    }
                    let delay = self.config.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    delay
                }
            };

            log::info!("Reconnecting to {} in {delay:?}", self.url);
            if !wait_offline(delay, &mut commands).await {
                break;
            }
        }

        self.set_state(ConnectionState::Closed).await;
        emit(&self.event_tx, SyncEvent::Closed);
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.shared.state.write().await = state;
    }

    async fn session<S>(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<S>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.outgoing_capacity.max(1));
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let mut session = Session {
            shared: &self.shared,
            event_tx: &self.event_tx,
            out_tx,
            token: None,
            deferred_until: None,
            deferred_attempts: 0,
            backoff: &self.config.backoff,
        };

        let end = match session.join(&self.info, self.document_id, &mut ws_reader, self.config.join_timeout).await {
            Ok(()) => session.pump_loop(&mut ws_reader, commands, &self.config).await,
            Err(e) => {
                log::warn!("Join of {} failed: {e}", self.document_id);
                SessionEnd::Lost { joined: false }
            }
        };

        drop(session);
        let _ = writer.await;
        end
    }
}

/// Wait out a reconnect delay. Returns `false` when asked to close.
async fn wait_offline(delay: Duration, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return true,
            cmd = commands.recv() => match cmd {
                Some(Command::Close) | None => return false,
                // Edits stay queued in the replica; presence is dropped.
                Some(Command::Flush) | Some(Command::Presence(_)) => {}
            },
        }
    }
}

fn emit(event_tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = event_tx.try_send(event) {
        log::debug!("Event queue full, dropping {event:?}");
    }
}

struct Session<'a> {
    shared: &'a Shared,
    event_tx: &'a mpsc::Sender<SyncEvent>,
    out_tx: mpsc::Sender<Vec<u8>>,
    token: Option<SessionToken>,
    deferred_until: Option<Instant>,
    deferred_attempts: u32,
    backoff: &'a Backoff,
}

enum Flow {
    Continue,
    End(SessionEnd),
}

impl Session<'_> {
    async fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        self.out_tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn join<R>(
        &mut self,
        info: &ParticipantInfo,
        document_id: DocumentId,
        ws_reader: &mut R,
        timeout: Duration,
    ) -> Result<(), ProtocolError>
    where
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let last_seen_revision = self.shared.replica.lock().await.last_seen_revision();
        self.send(&SyncMessage::Join { document_id, participant: info.clone(), last_seen_revision }).await?;

        let deadline = Instant::now() + timeout;
        let ack = loop {
            let msg = tokio::select! {
                msg = ws_reader.next() => msg,
                _ = sleep_until(deadline) => return Err(ProtocolError::Timeout),
            };
            match msg {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match SyncMessage::decode(&bytes)? {
                        ack @ SyncMessage::JoinAck { .. } => break ack,
                        other => log::debug!("Ignoring {} before JoinAck", other.kind()),
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Err(ProtocolError::ConnectionClosed),
                _ => {}
            }
        };

        let SyncMessage::JoinAck { snapshot, revision, session_token, participants, presences, missed } = ack else {
            return Err(ProtocolError::UnexpectedMessage("JoinAck"));
        };
        self.token = Some(session_token);

        let (events, len) = {
            let mut replica = self.shared.replica.lock().await;
            let events = replica.on_join_ack(&snapshot, &missed);
            (events, replica.view().len_chars())
        };
        let local = {
            let mut presence = self.shared.presence.lock().await;
            presence.load(&participants, &presences);
            presence.clamp_to(len);
            presence.force()
        };
        *self.shared.state.write().await = ConnectionState::Connected;
        log::info!("Joined {document_id} at revision {revision} ({} missed operations)", missed.len());
        emit(self.event_tx, SyncEvent::Connected { revision });

        // Resubmit first so the flushes inside dispatch find the op in flight.
        self.resubmit_or_flush().await?;
        if let Flow::End(_) = self.dispatch(events).await {
            log::warn!("Resynchronisation requested during join of {document_id}");
        }
        self.send(&SyncMessage::PresenceUpdate(local)).await
    }

    async fn pump_loop<R>(
        &mut self,
        ws_reader: &mut R,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        config: &ClientConfig,
    ) -> SessionEnd
    where
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        let mut missed_heartbeats: u32 = 0;
        let mut idle_sweep = tokio::time::interval((config.presence_idle_timeout / 4).max(Duration::from_millis(10)));

        loop {
            let deferred = self.deferred_until;
            let flow = tokio::select! {
                msg = ws_reader.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        missed_heartbeats = 0;
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) => self.handle_message(sync_msg).await,
                            Err(e) => {
                                log::warn!("Failed to decode server message: {e}");
                                Flow::Continue
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Server closed the connection");
                        Flow::End(SessionEnd::Lost { joined: true })
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        Flow::End(SessionEnd::Lost { joined: true })
                    }
                    Some(Ok(_)) => {
                        missed_heartbeats = 0;
                        Flow::Continue
                    }
                },

                _ = heartbeat.tick() => {
                    if missed_heartbeats >= config.missed_heartbeat_limit {
                        log::warn!("No reply to {missed_heartbeats} heartbeats, reconnecting");
                        Flow::End(SessionEnd::Lost { joined: true })
                    } else {
                        missed_heartbeats += 1;
                        self.flow_of(self.send(&SyncMessage::Heartbeat).await)
                    }
                }

                _ = idle_sweep.tick() => {
                    let expired = self.shared.presence.lock().await.cleanup_idle_peers();
                    for participant_id in expired {
                        log::debug!("Cursor of {participant_id} went idle");
                        emit(self.event_tx, SyncEvent::PresenceExpired(participant_id));
                    }
                    Flow::Continue
                }

                _ = async {
                    match deferred {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.deferred_until = None;
                    let result = self.resubmit_or_flush().await;
                    self.flow_of(result)
                }

                cmd = commands.recv() => match cmd {
                    Some(Command::Flush) => {
                        let result = self.flush().await;
                        self.flow_of(result)
                    }
                    Some(Command::Presence(presence)) => {
                        let result = self.send(&SyncMessage::PresenceUpdate(presence)).await;
                        self.flow_of(result)
                    }
                    Some(Command::Close) | None => {
                        if let Some(session_token) = self.token {
                            let _ = self.send(&SyncMessage::Leave { session_token }).await;
                        }
                        Flow::End(SessionEnd::Closed)
                    }
                },
            };

            if let Flow::End(end) = flow {
                return end;
            }
        }
    }

    fn flow_of(&self, result: Result<(), ProtocolError>) -> Flow {
        match result {
            Ok(()) => Flow::Continue,
            Err(e) => {
                log::warn!("Sending failed: {e}");
                Flow::End(SessionEnd::Lost { joined: true })
            }
        }
    }

    async fn handle_message(&mut self, msg: SyncMessage) -> Flow {
        match msg {
            SyncMessage::Accepted(accepted) | SyncMessage::Broadcast(accepted) => {
                let events = self.shared.replica.lock().await.receive(&accepted);
                self.dispatch(events).await
            }
            SyncMessage::Rejected { op_id, reason } => {
                let events = self.shared.replica.lock().await.on_rejected(op_id, reason);
                self.dispatch(events).await
            }
            SyncMessage::PresenceUpdate(presence) => {
                self.shared.presence.lock().await.handle_remote(presence.clone());
                emit(self.event_tx, SyncEvent::PresenceChanged(presence));
                Flow::Continue
            }
            SyncMessage::ParticipantJoined(info) => {
                self.shared.presence.lock().await.handle_joined(info.clone());
                emit(self.event_tx, SyncEvent::ParticipantJoined(info));
                Flow::Continue
            }
            SyncMessage::ParticipantLeft(participant_id) => {
                self.shared.presence.lock().await.handle_left(participant_id);
                emit(self.event_tx, SyncEvent::ParticipantLeft(participant_id));
                Flow::Continue
            }
            SyncMessage::HeartbeatAck => Flow::Continue,
            other => {
                log::debug!("Unexpected {} from server", other.kind());
                Flow::Continue
            }
        }
    }

    /// React to replica events, in order.
    async fn dispatch(&mut self, events: Vec<ReplicaEvent>) -> Flow {
        let mut flush = false;
        for event in events {
            match event {
                ReplicaEvent::Applied(op) => {
                    self.shared.presence.lock().await.rebase(&op);
                    emit(self.event_tx, SyncEvent::RemoteOp(op));
                }
                ReplicaEvent::Acknowledged { op_id, revision } => {
                    self.deferred_attempts = 0;
                    flush = true;
                    emit(self.event_tx, SyncEvent::Acknowledged { op_id, revision });
                }
                ReplicaEvent::ConflictSurfaced(conflict) => emit(self.event_tx, SyncEvent::Conflict(conflict)),
                ReplicaEvent::Discarded(op) => emit(self.event_tx, SyncEvent::Discarded(op)),
                ReplicaEvent::Deferred(op_id) => {
                    let delay = self.backoff.delay(self.deferred_attempts);
                    self.deferred_attempts = self.deferred_attempts.saturating_add(1);
                    log::info!("Resubmitting {op_id} in {delay:?}");
                    self.deferred_until = Some(Instant::now() + delay);
                }
                ReplicaEvent::Reset { revision } => {
                    let len = self.shared.replica.lock().await.view().len_chars();
                    self.shared.presence.lock().await.clamp_to(len);
                    flush = true;
                    emit(self.event_tx, SyncEvent::Reset { revision });
                }
                ReplicaEvent::ResyncRequired { fresh } => {
                    log::info!("Resynchronising (fresh snapshot: {fresh})");
                    return Flow::End(SessionEnd::Resync);
                }
                ReplicaEvent::RejoinRequired => return Flow::End(SessionEnd::Resync),
            }
        }
        if flush {
            let result = self.flush().await;
            return self.flow_of(result);
        }
        Flow::Continue
    }

    /// Submit the next queued operation if nothing is in flight.
    async fn flush(&self) -> Result<(), ProtocolError> {
        let Some(session_token) = self.token else {
            return Ok(());
        };
        let next = self.shared.replica.lock().await.next_submission();
        match next {
            Some(op) => {
                let base_revision = op.base_revision;
                self.send(&SyncMessage::Submit { session_token, op, base_revision }).await
            }
            None => Ok(()),
        }
    }

    /// Resend the in-flight operation as first submitted, or start the next.
    async fn resubmit_or_flush(&self) -> Result<(), ProtocolError> {
        let Some(session_token) = self.token else {
            return Ok(());
        };
        let resend = self.shared.replica.lock().await.resubmission();
        match resend {
            Some(op) => {
                log::debug!("Resubmitting {} at base {}", op.id, op.base_revision);
                let base_revision = op.base_revision;
                self.send(&SyncMessage::Submit { session_token, op, base_revision }).await
            }
            None => self.flush().await,
        }
    }
}
