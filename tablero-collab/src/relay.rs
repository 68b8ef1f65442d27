//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Peer A ──┐
//!           ├── RelayRoom (doc_id) ── fan-out ──┬── Peer A (echo dropped)
//! Peer B ──┘                                    ├── Peer B
//!                                               └── Peer C
//! ```
//!
//! The relay holds no document state and never rewrites a frame: peers
//! own their replicas and reconcile among themselves, the relay only
//! routes bytes between the members of a room. The one frame it mints
//! itself is a `peer_left` on behalf of a connection that dropped
//! without saying goodbye, so survivors can clear the roster.
//!
//! A connection is bound to the room named by its first decodable
//! envelope; frames for any other document on the same socket are
//! dropped.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{RelayRoom, RoomRegistry};
use crate::presence::peer_color;
use crate::protocol::{Envelope, PeerProfile};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections admitted per room
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before lagging sets in
    pub room_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            room_capacity: 256,
        }
    }
}

/// Relay-wide counters.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.room_capacity));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

/// Serve one WebSocket connection until it closes.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<RelayStats>>,
    config: RelayConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    // Bound on the first decodable envelope
    let mut peer_id: Option<Uuid> = None;
    let mut doc_id: Option<Uuid> = None;
    let mut room: Option<Arc<RelayRoom>> = None;
    let mut room_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

    loop {
        tokio::select! {
            // Inbound frame from this peer
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let env = match Envelope::decode(&bytes) {
                            Ok(env) => env,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame from {addr}: {e}");
                                continue;
                            }
                        };

                        {
                            let mut s = stats.write().await;
                            s.frames_received += 1;
                            s.bytes_received += bytes.len() as u64;
                        }

                        if env.kind.is_lifecycle() {
                            log::warn!("Dropping client-minted {:?} from {addr}", env.kind);
                            continue;
                        }

                        let bound_room = match &room {
                            Some(bound) => {
                                if doc_id != Some(env.doc_id) {
                                    log::warn!(
                                        "Frame for document {} on a connection bound to {:?}; dropped",
                                        env.doc_id,
                                        doc_id
                                    );
                                    continue;
                                }
                                bound.clone()
                            }
                            None => {
                                // First envelope names the room and the peer.
                                let candidate = registry.get_or_create(env.doc_id).await;
                                if candidate.peer_count().await >= config.max_peers_per_room {
                                    log::warn!(
                                        "Room {} full ({} peers); refusing {addr}",
                                        env.doc_id,
                                        config.max_peers_per_room
                                    );
                                    break;
                                }

                                let profile = env.profile().unwrap_or_else(|_| {
                                    PeerProfile::new("Anonymous", peer_color(env.peer_id))
                                });
                                let rx = candidate.join(env.peer_id, profile.clone()).await;

                                peer_id = Some(env.peer_id);
                                doc_id = Some(env.doc_id);
                                room_rx = Some(rx);
                                room = Some(candidate.clone());

                                {
                                    let mut s = stats.write().await;
                                    s.active_rooms = registry.room_count().await;
                                }

                                log::info!(
                                    "Peer {} ({}) joined room {}",
                                    profile.name,
                                    env.peer_id,
                                    env.doc_id
                                );
                                candidate
                            }
                        };

                        // Route untouched; receivers handle echoes and
                        // addressing (initial_state carries its target).
                        bound_room.relay_frame(Arc::new(bytes));
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            // Frame relayed into this peer's room
            msg = async {
                match room_rx {
                    Some(ref mut rx) => rx.recv().await,
                    // Not in a room yet; nothing can arrive
                    None => std::future::pending().await,
                }
            } => {
                match msg {
                    Ok(frame) => {
                        // Don't echo a peer's own frames back at it
                        if let Ok(env) = Envelope::decode(&frame) {
                            if Some(env.peer_id) == peer_id {
                                continue;
                            }
                        }
                        if ws_sender.send(Message::Binary(frame.to_vec().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Peer {peer_id:?} lagged by {n} frames");
                        if let Some(ref bound) = room {
                            bound.record_dropped(n);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    // Cleanup: unregister, tell survivors, reap the room if empty
    if let (Some(pid), Some(did), Some(bound)) = (peer_id, doc_id, room) {
        bound.leave(&pid).await;

        // Departure on the peer's behalf; harmless duplicate if the peer
        // already announced one itself.
        if let Ok(frame) = Envelope::peer_left(pid, did).encode() {
            bound.relay_frame(Arc::new(frame));
        }

        if registry.remove_if_empty(&did).await {
            log::info!("Room {did} removed (empty)");
        }

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = registry.room_count().await;
    } else {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.room_capacity, 256);
    }

    #[test]
    fn test_relay_creation() {
        let relay = RelayServer::with_defaults();
        assert_eq!(relay.bind_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_relay_custom_config() {
        let config = RelayConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_peers_per_room: 8,
            room_capacity: 64,
        };
        let relay = RelayServer::new(config);
        assert_eq!(relay.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let relay = RelayServer::with_defaults();
        let stats = relay.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.frames_received, 0);
        assert_eq!(stats.bytes_received, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_relay_starts_with_no_rooms() {
        let relay = RelayServer::with_defaults();
        assert_eq!(relay.registry().room_count().await, 0);
    }
}
