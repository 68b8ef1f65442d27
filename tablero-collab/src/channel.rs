//! WebSocket transport channel with bounded reconnection and a no-op
//! degraded mode.
//!
//! ```text
//!                    dial ok
//! connect() ────────────────────► Connected
//!     │                            ▲     │ socket lost: Disconnected
//!     │ dial failed                │     │ event, then Reconnecting
//!     ▼                    dial ok │     ▼
//! Detached (no-op sends)           └── attempt n of 5, waits base × n
//!                                        │
//!                                        └─ exhausted ──► Disconnected
//! ```
//!
//! The channel owns the socket lifecycle and nothing else: inbound
//! frames are decoded, own echoes and forged lifecycle kinds dropped,
//! and the rest handed to the [`Dispatcher`]. `Connected` /
//! `Disconnected` envelopes are dispatched locally on state changes so
//! subscribers can announce presence and restart handshakes. An explicit
//! `disconnect` is deliberate teardown and emits nothing.
//!
//! Reference: Kleppmann, Chapter 8 — Unreliable Networks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::dispatch::{Dispatcher, HandlerId};
use crate::protocol::{Envelope, EventKind, ProtocolError};

/// Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Initial dial failed; the channel accepts and drops traffic so the
    /// editor keeps working solo.
    Detached,
}

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Relay endpoint, e.g. "ws://127.0.0.1:9090"
    pub url: String,
    /// Reconnect attempts after a drop; 0 disables reconnection
    pub max_reconnect_attempts: u32,
    /// Backoff base: attempt n waits base × n
    pub reconnect_base_delay: Duration,
    /// Outgoing frame queue capacity
    pub send_queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            send_queue_capacity: 256,
        }
    }
}

/// Backoff before reconnect attempt `attempt` (1-based): base × attempt.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * attempt
}

/// Shared state between the channel handle and its socket tasks.
struct ChannelCore {
    peer_id: Uuid,
    doc_id: Uuid,
    config: ChannelConfig,
    state: RwLock<ConnectionState>,
    dispatcher: Dispatcher,
    /// Sender into the live writer task, when one exists
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Bumped on every connect/disconnect; tasks from an older
    /// generation find the mismatch and stand down
    generation: AtomicU64,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelCore {
    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.write().unwrap() = next;
    }

    fn dispatch_lifecycle(&self, kind: EventKind) {
        let env = match kind {
            EventKind::Connected => Envelope::connected(self.peer_id, self.doc_id),
            _ => Envelope::disconnected(self.peer_id, self.doc_id),
        };
        self.dispatcher.dispatch(&env);
    }

    /// Abort every task belonging to the current connection and invalidate
    /// their generation. Safe to call with nothing running.
    fn teardown_connection(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        for slot in [&self.reconnect_task, &self.reader_task, &self.writer_task] {
            if let Some(task) = slot.lock().unwrap().take() {
                task.abort();
            }
        }
        self.outgoing.lock().unwrap().take();
    }
}

/// Transport channel for one document.
///
/// Cheap to share: the facade holds it in an [`Arc`] and its event
/// handlers capture clones.
pub struct DocChannel {
    core: Arc<ChannelCore>,
}

impl DocChannel {
    pub fn new(peer_id: Uuid, doc_id: Uuid, config: ChannelConfig) -> Self {
        Self {
            core: Arc::new(ChannelCore {
                peer_id,
                doc_id,
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                dispatcher: Dispatcher::new(),
                outgoing: Mutex::new(None),
                generation: AtomicU64::new(0),
                reconnect_task: Mutex::new(None),
                reader_task: Mutex::new(None),
                writer_task: Mutex::new(None),
            }),
        }
    }

    /// Dial the relay.
    ///
    /// Never returns an error: a failed initial dial leaves the channel
    /// in [`ConnectionState::Detached`], where sends are accepted and
    /// dropped, and still dispatches a `Connected` event so the rest of
    /// the stack behaves identically solo. The returned state says which
    /// of the two happened.
    pub async fn connect(&self) -> ConnectionState {
        // A fresh connect supersedes any previous socket or pending
        // reconnect timer.
        self.core.teardown_connection();
        self.core.set_state(ConnectionState::Connecting);

        match dial(&self.core).await {
            Ok(()) => ConnectionState::Connected,
            Err(e) => {
                log::warn!(
                    "Relay {} unreachable ({e}); continuing detached",
                    self.core.config.url
                );
                self.core.set_state(ConnectionState::Detached);
                self.core.dispatch_lifecycle(EventKind::Connected);
                ConnectionState::Detached
            }
        }
    }

    /// Queue an envelope for transmission.
    ///
    /// Fire-and-forget: when the channel is detached, reconnecting, or
    /// the queue is full, the frame is dropped with a log instead of an
    /// error. Only serialization failures are reported.
    pub fn send(&self, env: Envelope) -> Result<(), ProtocolError> {
        match self.core.state() {
            ConnectionState::Connected => {}
            other => {
                log::debug!("Not connected ({other:?}); dropping outbound {:?}", env.kind);
                return Ok(());
            }
        }

        let encoded = env.encode()?;
        let sender = self.core.outgoing.lock().unwrap().clone();
        if let Some(tx) = sender {
            if let Err(e) = tx.try_send(encoded) {
                log::warn!("Outbound queue rejected {:?}: {e}", env.kind);
            }
        }
        Ok(())
    }

    /// Register a subscriber for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.core.dispatcher.on(kind, handler)
    }

    /// Remove a subscriber by its handle.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.core.dispatcher.off(kind, id)
    }

    /// Remove every subscriber (facade teardown).
    pub fn clear_handlers(&self) {
        self.core.dispatcher.clear();
    }

    /// Close the connection and cancel any pending reconnection.
    ///
    /// Deliberate teardown: no `Disconnected` event is dispatched. Frames
    /// already queued are given a moment to drain before the writer is
    /// dropped, so a just-sent departure announcement makes it out.
    pub async fn disconnect(&self) {
        self.core.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.core.reconnect_task.lock().unwrap().take() {
            task.abort();
        }

        // Dropping the sender lets the writer drain its queue and exit.
        let writer = {
            self.core.outgoing.lock().unwrap().take();
            self.core.writer_task.lock().unwrap().take()
        };
        if let Some(handle) = writer {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
        if let Some(task) = self.core.reader_task.lock().unwrap().take() {
            task.abort();
        }

        self.core.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn is_connected(&self) -> bool {
        self.core.state() == ConnectionState::Connected
    }

    pub fn peer_id(&self) -> Uuid {
        self.core.peer_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.core.doc_id
    }

    pub fn url(&self) -> &str {
        &self.core.config.url
    }
}

/// Open a socket and wire up the writer and reader tasks.
///
/// Returns a boxed future: dial spawns the reader, the reader spawns the
/// reconnect loop, and that loop awaits dial again, so an opaque `async fn`
/// future here makes `Send` inference cyclic and uninferable.
fn dial(
    core: &Arc<ChannelCore>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ProtocolError>> + Send + '_>> {
    Box::pin(dial_inner(core))
}

async fn dial_inner(core: &Arc<ChannelCore>) -> Result<(), ProtocolError> {
    let url = format!("{}/{}", core.config.url, core.doc_id);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
        log::debug!("Dial {url} failed: {e}");
        ProtocolError::ConnectionClosed
    })?;

    let generation = core.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(core.config.send_queue_capacity);
    *core.outgoing.lock().unwrap() = Some(out_tx);

    // Writer task: forward the outgoing queue onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
    });
    *core.writer_task.lock().unwrap() = Some(writer);

    // Reader task: decode, filter, dispatch; detect connection loss.
    let reader_core = core.clone();
    let reader = tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    match Envelope::decode(&bytes) {
                        Ok(env) => {
                            if env.peer_id == reader_core.peer_id {
                                continue; // relay echo of our own frame
                            }
                            if env.kind.is_lifecycle() {
                                log::warn!(
                                    "Dropping forged lifecycle frame from {}",
                                    env.peer_id
                                );
                                continue;
                            }
                            reader_core.dispatcher.dispatch(&env);
                        }
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }

        // Socket gone. Only the live generation reports the loss; an
        // explicit connect/disconnect has already superseded older tasks.
        if reader_core.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        reader_core.outgoing.lock().unwrap().take();
        reader_core.set_state(ConnectionState::Disconnected);
        reader_core.dispatch_lifecycle(EventKind::Disconnected);

        if reader_core.config.max_reconnect_attempts > 0 {
            let loop_core = reader_core.clone();
            let handle = tokio::spawn(reconnect_loop(loop_core, generation));
            *reader_core.reconnect_task.lock().unwrap() = Some(handle);
        }
    });
    *core.reader_task.lock().unwrap() = Some(reader);

    core.set_state(ConnectionState::Connected);
    core.dispatch_lifecycle(EventKind::Connected);
    Ok(())
}

/// Bounded redial loop after a connection loss.
async fn reconnect_loop(core: Arc<ChannelCore>, from_generation: u64) {
    let max = core.config.max_reconnect_attempts;
    for attempt in 1..=max {
        // Stand down if an explicit connect/disconnect superseded us.
        if core.generation.load(Ordering::SeqCst) != from_generation {
            return;
        }
        core.set_state(ConnectionState::Reconnecting);
        tokio::time::sleep(backoff_delay(core.config.reconnect_base_delay, attempt)).await;

        if core.generation.load(Ordering::SeqCst) != from_generation {
            return;
        }

        log::info!("Reconnect attempt {attempt}/{max} to {}", core.config.url);
        if dial(&core).await.is_ok() {
            return;
        }
    }

    core.set_state(ConnectionState::Disconnected);
    log::warn!("Reconnection abandoned after {max} attempts");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// A port with nothing listening; dials fail fast on loopback.
    const DEAD_URL: &str = "ws://127.0.0.1:1";

    #[test]
    fn test_channel_initial_state() {
        let channel = DocChannel::new(Uuid::new_v4(), Uuid::new_v4(), ChannelConfig::default());
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(!channel.is_connected());
    }

    #[test]
    fn test_backoff_is_linear_in_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 5), Duration::from_secs(5));

        let fast = Duration::from_millis(100);
        assert_eq!(backoff_delay(fast, 3), Duration::from_millis(300));
    }

    #[test]
    fn test_config_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
        assert_eq!(config.send_queue_capacity, 256);
    }

    #[tokio::test]
    async fn test_initial_dial_failure_degrades_to_detached() {
        let channel = DocChannel::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ChannelConfig {
                url: DEAD_URL.to_string(),
                ..ChannelConfig::default()
            },
        );

        let connected_events = Arc::new(AtomicUsize::new(0));
        {
            let connected_events = connected_events.clone();
            channel.on(EventKind::Connected, move |_| {
                connected_events.fetch_add(1, Ordering::SeqCst);
            });
        }

        let state = channel.connect().await;
        assert_eq!(state, ConnectionState::Detached);
        assert_eq!(channel.state(), ConnectionState::Detached);
        // Degraded mode still reports readiness to subscribers.
        assert_eq!(connected_events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_while_detached_is_silent() {
        let channel = DocChannel::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ChannelConfig {
                url: DEAD_URL.to_string(),
                ..ChannelConfig::default()
            },
        );
        channel.connect().await;

        let env = Envelope::entity_update(channel.peer_id(), channel.doc_id(), 1, Vec::new());
        assert!(channel.send(env).is_ok());
    }

    #[tokio::test]
    async fn test_send_before_connect_is_silent() {
        let channel = DocChannel::new(Uuid::new_v4(), Uuid::new_v4(), ChannelConfig::default());
        let env = Envelope::peer_left(channel.peer_id(), channel.doc_id());
        assert!(channel.send(env).is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let channel = DocChannel::new(Uuid::new_v4(), Uuid::new_v4(), ChannelConfig::default());
        channel.disconnect().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handler_removal_via_channel() {
        let channel = DocChannel::new(Uuid::new_v4(), Uuid::new_v4(), ChannelConfig::default());
        let id = channel.on(EventKind::PeerJoined, |_| {});
        assert!(channel.off(EventKind::PeerJoined, id));
        assert!(!channel.off(EventKind::PeerJoined, id));
    }
}
