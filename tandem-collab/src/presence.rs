//! Cursor and selection presence.
//!
//! ```text
//! Local caret move
//!       │
//!       ▼
//! PresenceRoom::update_local()   (rate-limited: 30 updates/s)
//!       │
//!       ▼   SyncMessage::PresenceUpdate
//! Server PresenceTracker::update()  (last write wins, stamped)
//!       │
//!       ▼   broadcast, excluding the author
//! Remote PresenceRoom::handle_remote()
//! ```
//!
//! Presence never waits on the sequencer. Remote cursor offsets are rebased
//! locally through every operation the replica applies so they stay on the
//! same characters between updates.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tandem_core::{transform_offset, transform_range, Bias, Operation, ParticipantId};
use uuid::Uuid;

use crate::protocol::{ParticipantInfo, Presence};

/// Cursor color as 8-bit sRGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl CursorColor {
    /// Stable color for a participant: the hue comes from the id,
    /// saturation and value are fixed.
    pub fn from_uuid(id: Uuid) -> Self {
        let (high, low) = id.as_u64_pair();
        // Top 53 bits map exactly onto [0, 1).
        let hue = ((high ^ low) >> 11) as f64 / (1u64 << 53) as f64;
        Self::from_hsv(hue, 0.65, 0.9)
    }

    fn from_hsv(hue: f64, saturation: f64, value: f64) -> Self {
        let sector = hue.rem_euclid(1.0) * 6.0;
        let chroma = value * saturation;
        let x = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
        let (r, g, b) = match sector as u8 {
            0 => (chroma, x, 0.0),
            1 => (x, chroma, 0.0),
            2 => (0.0, chroma, x),
            3 => (0.0, x, chroma),
            4 => (x, 0.0, chroma),
            _ => (chroma, 0.0, x),
        };
        let offset = value - chroma;
        let channel = |c: f64| ((c + offset).clamp(0.0, 1.0) * 255.0).round() as u8;
        Self { r: channel(r), g: channel(g), b: channel(b) }
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 66, g: 133, b: 245 }
    }
}

impl std::fmt::Display for CursorColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ───────────────────────────────────────────────────────────────────
// Server side
// ───────────────────────────────────────────────────────────────────

/// Latest presence per participant of one document.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: HashMap<ParticipantId, Presence>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the participant's presence unconditionally and return the
    /// stamped copy to broadcast.
    pub fn update(&mut self, mut presence: Presence) -> Presence {
        presence.updated_at = now_millis();
        self.entries.insert(presence.participant_id, presence.clone());
        presence
    }

    pub fn remove(&mut self, participant_id: ParticipantId) -> Option<Presence> {
        self.entries.remove(&participant_id)
    }

    pub fn get(&self, participant_id: ParticipantId) -> Option<&Presence> {
        self.entries.get(&participant_id)
    }

    pub fn all(&self) -> Vec<Presence> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Client side
// ───────────────────────────────────────────────────────────────────

/// A remote participant as seen by this client.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub info: ParticipantInfo,
    /// Last presence received, rebased through later operations
    pub presence: Option<Presence>,
    last_update: Instant,
}

impl RemotePeer {
    fn new(info: ParticipantInfo) -> Self {
        Self { info, presence: None, last_update: Instant::now() }
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }

    pub fn cursor_offset(&self) -> Option<usize> {
        self.presence.as_ref().map(|p| p.cursor_offset)
    }
}

/// Presence state of every remote participant in a document, plus the
/// local participant's own caret.
pub struct PresenceRoom {
    local: Presence,
    peers: HashMap<ParticipantId, RemotePeer>,
    last_broadcast: Option<Instant>,
    /// Minimum interval between local broadcasts (33ms ≈ 30/s)
    broadcast_interval: Duration,
    idle_timeout: Duration,
}

impl PresenceRoom {
    pub fn new(local_participant: ParticipantId) -> Self {
        Self {
            local: Presence::at(local_participant, 0),
            peers: HashMap::new(),
            last_broadcast: None,
            broadcast_interval: Duration::from_millis(33),
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Custom broadcast interval (for testing).
    pub fn with_interval(local_participant: ParticipantId, interval: Duration) -> Self {
        let mut room = Self::new(local_participant);
        room.broadcast_interval = interval;
        room
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Record the local caret. Returns the update to send, or `None` when
    /// throttled.
    pub fn update_local(&mut self, cursor_offset: usize, selection: Option<(usize, usize)>) -> Option<Presence> {
        self.local.cursor_offset = cursor_offset;
        self.local.selection = selection;

        if let Some(last) = self.last_broadcast {
            if last.elapsed() < self.broadcast_interval {
                return None;
            }
        }
        Some(self.force())
    }

    pub fn set_active_file(&mut self, file: Option<String>) -> Presence {
        self.local.active_file = file;
        self.force()
    }

    /// Current local presence regardless of rate limiting.
    pub fn force(&mut self) -> Presence {
        self.last_broadcast = Some(Instant::now());
        self.local.clone()
    }

    pub fn local(&self) -> &Presence {
        &self.local
    }

    pub fn local_participant(&self) -> ParticipantId {
        self.local.participant_id
    }

    /// Replace all remote state with the roster of a `JoinAck`.
    pub fn load(&mut self, participants: &[ParticipantInfo], presences: &[Presence]) {
        self.peers.clear();
        for info in participants {
            self.handle_joined(info.clone());
        }
        for presence in presences {
            self.handle_remote(presence.clone());
        }
    }

    pub fn handle_joined(&mut self, info: ParticipantInfo) {
        if info.participant_id == self.local.participant_id {
            return;
        }
        self.peers
            .entry(info.participant_id)
            .and_modify(|peer| peer.info = info.clone())
            .or_insert_with(|| RemotePeer::new(info));
    }

    pub fn handle_left(&mut self, participant_id: ParticipantId) -> Option<RemotePeer> {
        self.peers.remove(&participant_id)
    }

    /// Last write wins. Presence from an unknown participant creates a
    /// placeholder entry (it joined before this client did).
    pub fn handle_remote(&mut self, presence: Presence) {
        let id = presence.participant_id;
        if id == self.local.participant_id {
            return;
        }
        let peer = self.peers.entry(id).or_insert_with(|| {
            RemotePeer::new(ParticipantInfo::new(id, format!("Peer-{}", &id.to_string()[..8])))
        });
        peer.presence = Some(presence);
        peer.last_update = Instant::now();
    }

    /// Shift every cursor through an operation applied to the local view.
    ///
    /// A caret sticks after text its own participant inserted and in front
    /// of text anyone else inserted at the same offset.
    pub fn rebase(&mut self, op: &Operation) {
        let author = op.author();
        rebase_presence(&mut self.local, op, author);
        for peer in self.peers.values_mut() {
            if let Some(presence) = peer.presence.as_mut() {
                rebase_presence(presence, op, author);
            }
        }
    }

    /// Clamp every cursor after the view was replaced by a snapshot.
    pub fn clamp_to(&mut self, len: usize) {
        clamp_presence(&mut self.local, len);
        for peer in self.peers.values_mut() {
            if let Some(presence) = peer.presence.as_mut() {
                clamp_presence(presence, len);
            }
        }
    }

    pub fn peer(&self, participant_id: &ParticipantId) -> Option<&RemotePeer> {
        self.peers.get(participant_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drop the cursors of peers whose presence has not changed within the
    /// idle timeout. The peers stay in the roster until the server
    /// announces they left.
    pub fn cleanup_idle_peers(&mut self) -> Vec<ParticipantId> {
        let timeout = self.idle_timeout;
        let mut expired = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            if peer.presence.is_some() && peer.is_idle(timeout) {
                peer.presence = None;
                expired.push(*id);
            }
        }
        expired
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

fn rebase_presence(presence: &mut Presence, op: &Operation, author: ParticipantId) {
    let bias = if presence.participant_id == author { Bias::After } else { Bias::Before };
    presence.cursor_offset = transform_offset(presence.cursor_offset, op, bias);
    presence.selection = presence.selection.map(|(start, end)| transform_range(start, end, op));
}

fn clamp_presence(presence: &mut Presence, len: usize) {
    presence.cursor_offset = presence.cursor_offset.min(len);
    presence.selection = presence.selection.map(|(start, end)| (start.min(len), end.min(len)));
}
