//! Peer roster with liveness tracking.
//!
//! Tracks who is in the document right now: display profile, assigned
//! color, last cursor position, and a last-seen stamp refreshed by every
//! event the peer sends. Peers silent for the liveness window are removed
//! by a periodic sweep rather than per-peer timers, so departure is
//! detected within one sweep interval of the deadline.
//!
//! All mutators take an explicit `now_ms` to keep sweeps deterministic
//! under test.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::PeerProfile;
use tablero_core::Position;

/// Window after which a silent peer is considered gone.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(30);
/// Interval between eviction sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Palette for peer cursors and name tags.
const PALETTE: [&str; 8] = [
    "#3b82f6", "#22c55e", "#a855f7", "#ef4444", "#eab308", "#ec4899", "#6366f1", "#14b8a6",
];

/// Stable palette color for a peer id.
///
/// Folds the hyphenated id string with the classic djb2-style shift and
/// indexes the palette, so every replica assigns a peer the same color
/// without coordination.
pub fn peer_color(id: Uuid) -> &'static str {
    let mut hash: i32 = 0;
    for byte in id.to_string().bytes() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(byte as i32);
    }
    PALETTE[hash.unsigned_abs() as usize % PALETTE.len()]
}

/// One remote peer as tracked locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Peer {
    pub id: Uuid,
    pub name: String,
    /// Hex color from the peer's own join announcement
    pub color: String,
    /// Last broadcast cursor position, if any
    pub cursor: Option<Position>,
    /// Wall-clock ms of the last event seen from this peer
    pub last_seen_ms: u64,
}

/// Roster of remote peers for one document.
///
/// The local peer is never listed: its id is filtered at insert time, so
/// relay echoes cannot put the local user in their own roster.
pub struct PresenceRegistry {
    local_id: Uuid,
    peers: HashMap<Uuid, Peer>,
    liveness_window: Duration,
}

impl PresenceRegistry {
    pub fn new(local_id: Uuid) -> Self {
        Self::with_window(local_id, LIVENESS_WINDOW)
    }

    pub fn with_window(local_id: Uuid, liveness_window: Duration) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
            liveness_window,
        }
    }

    /// Record a join announcement.
    ///
    /// Idempotent: a re-join (reconnect, duplicated frame) refreshes the
    /// profile and last-seen stamp instead of duplicating the entry.
    pub fn apply_join(&mut self, peer_id: Uuid, profile: &PeerProfile, now_ms: u64) {
        if peer_id == self.local_id {
            return;
        }
        let entry = self.peers.entry(peer_id).or_insert_with(|| Peer {
            id: peer_id,
            name: profile.name.clone(),
            color: profile.color.clone(),
            cursor: None,
            last_seen_ms: now_ms,
        });
        entry.name = profile.name.clone();
        entry.color = profile.color.clone();
        entry.last_seen_ms = now_ms;
    }

    /// Remove a departing peer. Unknown ids are a no-op.
    pub fn apply_leave(&mut self, peer_id: Uuid) -> Option<Peer> {
        self.peers.remove(&peer_id)
    }

    /// Update a known peer's cursor.
    ///
    /// Cursor frames from unknown peers are dropped: only a join may
    /// create a roster entry, otherwise a stale cursor arriving after a
    /// leave would resurrect the peer as a ghost.
    pub fn apply_cursor(&mut self, peer_id: Uuid, cursor: Position, now_ms: u64) {
        if peer_id == self.local_id {
            return;
        }
        match self.peers.get_mut(&peer_id) {
            Some(peer) => {
                peer.cursor = Some(cursor);
                peer.last_seen_ms = now_ms;
            }
            None => log::debug!("Dropping cursor from unknown peer {peer_id}"),
        }
    }

    /// Refresh last-seen for any event from an already-known peer.
    pub fn touch(&mut self, peer_id: Uuid, now_ms: u64) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.last_seen_ms = now_ms;
        }
    }

    /// Remove peers unrefreshed for the full liveness window.
    /// Returns the evicted ids.
    pub fn evict_stale(&mut self, now_ms: u64) -> Vec<Uuid> {
        let window_ms = self.liveness_window.as_millis() as u64;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, peer)| now_ms.saturating_sub(peer.last_seen_ms) >= window_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
            log::info!("Evicted silent peer {id}");
        }
        stale
    }

    /// Roster snapshot ordered by display name (id as tiebreaker) for
    /// stable UI lists.
    pub fn peers(&self) -> Vec<Peer> {
        let mut list: Vec<Peer> = self.peers.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn get(&self, peer_id: &Uuid) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &Uuid) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }
}
