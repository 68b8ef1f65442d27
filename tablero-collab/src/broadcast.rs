//! Per-document relay rooms with N-1 fan-out.
//!
//! Each document gets one tokio broadcast channel; every connected peer
//! holds an independent receiver buffering up to `capacity` frames. The
//! relay hands pre-encoded frames straight through, so the hot path is a
//! single lock-free send. Slow consumers lag and shed the oldest frames
//! rather than stalling the room.
//!
//! Performance target: 1,000 frames to 100 peers < 10ms
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::PeerProfile;

/// Snapshot of a room's relay counters.
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub frames_relayed: u64,
    pub frames_dropped: u64,
    pub active_peers: usize,
}

/// Counters updated without taking the room lock.
struct AtomicRoomStats {
    frames_relayed: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicRoomStats {
    fn new() -> Self {
        Self {
            frames_relayed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// Fan-out group for the peers of one document.
pub struct RelayRoom {
    /// Frame channel; every peer connection subscribes
    sender: broadcast::Sender<Arc<Vec<u8>>>,

    /// Roster of peers currently wired into this room
    peers: RwLock<HashMap<Uuid, PeerProfile>>,

    /// Frames buffered per receiver before lagging sets in
    capacity: usize,

    stats: AtomicRoomStats,
}

impl RelayRoom {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicRoomStats::new(),
        }
    }

    /// Register a peer and hand back its frame receiver.
    ///
    /// Joining twice with the same id just refreshes the profile; the
    /// old receiver keeps working.
    pub async fn join(&self, peer_id: Uuid, profile: PeerProfile) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(peer_id, profile);
        self.sender.subscribe()
    }

    /// Drop a peer from the roster.
    pub async fn leave(&self, peer_id: &Uuid) -> Option<PeerProfile> {
        let mut peers = self.peers.write().await;
        peers.remove(peer_id)
    }

    /// Fan a pre-encoded frame out to every receiver.
    ///
    /// The sender's own receiver gets the frame too; echo suppression is
    /// the receiving side's job. Returns the receiver count, 0 when the
    /// room has no listeners.
    pub fn relay_frame(&self, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.frames_relayed.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.stats.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Subscribe without joining the roster.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    /// Current roster as (id, profile) pairs.
    pub async fn roster(&self) -> Vec<(Uuid, PeerProfile)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, profile)| (*id, profile.clone()))
            .collect()
    }

    pub async fn stats(&self) -> RoomStats {
        let peers = self.peers.read().await;
        RoomStats {
            frames_relayed: self.stats.frames_relayed.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps document ids to their relay rooms.
///
/// Rooms are created on first join and reaped once the last peer hangs
/// up, so an idle relay holds no per-document state.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<RelayRoom>>>,
    default_capacity: usize,
}

impl RoomRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Fetch the room for a document, creating it on first use.
    pub async fn get_or_create(&self, doc_id: Uuid) -> Arc<RelayRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock
        if let Some(room) = rooms.get(&doc_id) {
            return room.clone();
        }

        let room = Arc::new(RelayRoom::new(self.default_capacity));
        rooms.insert(doc_id, room.clone());
        room
    }

    /// Reap a room with no peers left. Returns whether it was removed.
    pub async fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.peer_count().await == 0 {
                rooms.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
