//! Collaboration facade: one handle that the editor talks to.
//!
//! Join sequence:
//! ```text
//! Peer A (joiner)                relay                 Peer B (resident)
//!    │                             │                         │
//!    │── peer_joined ─────────────►│────────────────────────►│ roster += A
//!    │── request_initial_state ───►│────────────────────────►│
//!    │                             │◄── initial_state(to:A) ─│
//!    │◄────────────────────────────│  adopt if still empty   │
//!    │                             │                         │
//!    ╰─ handshake window passes with no reply: seed from the
//!       local snapshot store instead
//! ```
//!
//! After the handshake every replica runs the same loop: cache local
//! edits, stamp and publish them, let the reconciler arbitrate inbound
//! collections, and surface the survivors through change callbacks.
//! Cursor traffic rides the same channel but is throttled and never
//! touches the document.
//!
//! The facade is safe to drive before the relay answers: edits made
//! while detached or reconnecting land in the local mirror and are
//! served to whoever asks once traffic flows again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use uuid::Uuid;

use tablero_core::{Document, Entity, Link, Position};

use crate::channel::{ChannelConfig, ConnectionState, DocChannel};
use crate::dispatch::HandlerId;
use crate::presence::{peer_color, Peer, PresenceRegistry, LIVENESS_WINDOW, SWEEP_INTERVAL};
use crate::protocol::{unix_millis, Envelope, EventKind, PeerProfile};
use crate::reconcile::{ApplyOutcome, Reconciler};
use crate::store::SnapshotStore;
use crate::throttle::{Offer, Throttle, CURSOR_INTERVAL};

/// Facade tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay endpoint
    pub relay_url: String,
    /// Name shown to other peers
    pub display_name: String,
    /// Silence tolerated before a peer is evicted from the roster
    pub liveness_window: Duration,
    /// How often the roster is swept for silent peers
    pub sweep_interval: Duration,
    /// Minimum spacing between outbound cursor frames
    pub cursor_interval: Duration,
    /// How long to wait for an `initial_state` reply before falling
    /// back to the snapshot store
    pub handshake_window: Duration,
    /// How often the mirror is persisted (when a store is attached)
    pub persist_interval: Duration,
    /// Reconnect attempts after a drop
    pub max_reconnect_attempts: u32,
    /// Backoff base: attempt n waits base × n
    pub reconnect_base_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9090".to_string(),
            display_name: "Anonymous".to_string(),
            liveness_window: LIVENESS_WINDOW,
            sweep_interval: SWEEP_INTERVAL,
            cursor_interval: CURSOR_INTERVAL,
            handshake_window: Duration::from_secs(2),
            persist_interval: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
        }
    }
}

type EntityCallback = Arc<dyn Fn(&[Entity]) + Send + Sync>;
type LinkCallback = Arc<dyn Fn(&[Link]) + Send + Sync>;

/// Mutable session internals, one lock for all of them.
///
/// Event handlers collect what they need under this lock and invoke
/// callbacks only after releasing it, so a callback may call back into
/// the session freely.
struct SessionState {
    presence: PresenceRegistry,
    reconciler: Reconciler,
    cursor_throttle: Throttle<Position>,
    entity_callbacks: Vec<EntityCallback>,
    link_callbacks: Vec<LinkCallback>,
}

/// State shared between the facade handle, event handlers, and tasks.
struct SessionShared {
    peer_id: Uuid,
    doc_id: Uuid,
    profile: PeerProfile,
    config: SessionConfig,
    /// Readiness flag; also true in detached mode
    connected: AtomicBool,
    state: Mutex<SessionState>,
    store: Option<Arc<dyn SnapshotStore>>,
}

/// A live collaboration session on one document.
pub struct CollabSession {
    channel: Arc<DocChannel>,
    shared: Arc<SessionShared>,
    handler_ids: Vec<(EventKind, HandlerId)>,
    tasks: Vec<JoinHandle<()>>,
    cursor_flush: Arc<Mutex<Option<JoinHandle<()>>>>,
    seed_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CollabSession {
    /// Join a document without local persistence.
    pub async fn connect(doc_id: Uuid, config: SessionConfig) -> Self {
        Self::start(doc_id, config, None).await
    }

    /// Join a document, seeding from and persisting to `store`.
    pub async fn connect_with_store(
        doc_id: Uuid,
        config: SessionConfig,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self::start(doc_id, config, Some(store)).await
    }

    async fn start(
        doc_id: Uuid,
        config: SessionConfig,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        let peer_id = Uuid::new_v4();
        let profile = PeerProfile::new(config.display_name.clone(), peer_color(peer_id));

        let channel = Arc::new(DocChannel::new(
            peer_id,
            doc_id,
            ChannelConfig {
                url: config.relay_url.clone(),
                max_reconnect_attempts: config.max_reconnect_attempts,
                reconnect_base_delay: config.reconnect_base_delay,
                ..ChannelConfig::default()
            },
        ));

        let shared = Arc::new(SessionShared {
            peer_id,
            doc_id,
            profile,
            connected: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                presence: PresenceRegistry::with_window(peer_id, config.liveness_window),
                reconciler: Reconciler::new(peer_id),
                cursor_throttle: Throttle::new(config.cursor_interval),
                entity_callbacks: Vec::new(),
                link_callbacks: Vec::new(),
            }),
            store,
            config,
        });

        let seed_task = Arc::new(Mutex::new(None));

        // Handlers must be live before dialing: the Connected event
        // (real or detached) fires during connect.
        let handler_ids = register_handlers(&channel, &shared, &seed_task);

        channel.connect().await;

        let mut tasks = vec![spawn_sweep(shared.clone())];
        if shared.store.is_some() {
            tasks.push(spawn_persist(shared.clone()));
        }

        Self {
            channel,
            shared,
            handler_ids,
            tasks,
            cursor_flush: Arc::new(Mutex::new(None)),
            seed_task,
        }
    }

    // ─── Outbound ───────────────────────────────────────────────────

    /// Replace and publish the entity collection.
    ///
    /// The local mirror is always updated, connected or not; the frame
    /// only goes out when traffic flows. The publication stamp doubles
    /// as the watermark so our own relay echo can never re-apply.
    pub fn broadcast_entity_update(&self, entities: Vec<Entity>) {
        let frame = {
            let mut st = self.shared.state.lock().unwrap();
            st.reconciler.cache_entities(entities.clone());
            if self.shared.connected.load(Ordering::SeqCst) {
                let stamp = unix_millis();
                st.reconciler.mark_published(stamp);
                Some(Envelope::entity_update(
                    self.shared.peer_id,
                    self.shared.doc_id,
                    stamp,
                    entities,
                ))
            } else {
                None
            }
        };
        if let Some(env) = frame {
            if let Err(e) = self.channel.send(env) {
                log::error!("Entity update not sent: {e}");
            }
        }
    }

    /// Replace and publish the link collection.
    pub fn broadcast_link_update(&self, links: Vec<Link>) {
        let frame = {
            let mut st = self.shared.state.lock().unwrap();
            st.reconciler.cache_links(links.clone());
            if self.shared.connected.load(Ordering::SeqCst) {
                let stamp = unix_millis();
                st.reconciler.mark_published(stamp);
                Some(Envelope::link_update(
                    self.shared.peer_id,
                    self.shared.doc_id,
                    stamp,
                    links,
                ))
            } else {
                None
            }
        };
        if let Some(env) = frame {
            if let Err(e) = self.channel.send(env) {
                log::error!("Link update not sent: {e}");
            }
        }
    }

    /// Publish the local cursor position, rate limited.
    ///
    /// At most one frame per configured interval; movement inside the
    /// window is coalesced into one trailing frame. Offline cursors are
    /// dropped outright, they carry no document state worth queueing.
    pub fn broadcast_cursor_move(&self, cursor: Position) {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return;
        }
        let decision = {
            let mut st = self.shared.state.lock().unwrap();
            st.cursor_throttle.offer(cursor, Instant::now())
        };
        match decision {
            Offer::Fire => self.send_cursor(cursor),
            Offer::Schedule(delay) => self.arm_cursor_flush(delay),
            Offer::Coalesced => {}
        }
    }

    fn send_cursor(&self, cursor: Position) {
        let env = Envelope::cursor_move(self.shared.peer_id, self.shared.doc_id, cursor);
        if let Err(e) = self.channel.send(env) {
            log::error!("Cursor frame not sent: {e}");
        }
    }

    /// Arm the trailing flush for a cursor parked inside the window.
    fn arm_cursor_flush(&self, delay: Duration) {
        let shared = self.shared.clone();
        let channel = self.channel.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let flushed = {
                let mut st = shared.state.lock().unwrap();
                st.cursor_throttle.flush(Instant::now())
            };
            if let Some(cursor) = flushed {
                if shared.connected.load(Ordering::SeqCst) {
                    let env = Envelope::cursor_move(shared.peer_id, shared.doc_id, cursor);
                    if let Err(e) = channel.send(env) {
                        log::error!("Cursor frame not sent: {e}");
                    }
                }
            }
        });
        if let Some(old) = self.cursor_flush.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    // ─── Callbacks ──────────────────────────────────────────────────

    /// Observe entity collection changes applied from remote peers.
    pub fn on_entities_change<F>(&self, callback: F)
    where
        F: Fn(&[Entity]) + Send + Sync + 'static,
    {
        let mut st = self.shared.state.lock().unwrap();
        st.entity_callbacks.push(Arc::new(callback));
    }

    /// Observe link collection changes applied from remote peers.
    pub fn on_links_change<F>(&self, callback: F)
    where
        F: Fn(&[Link]) + Send + Sync + 'static,
    {
        let mut st = self.shared.state.lock().unwrap();
        st.link_callbacks.push(Arc::new(callback));
    }

    // ─── Accessors ──────────────────────────────────────────────────

    /// Live peers, sorted for stable display.
    pub fn peers(&self) -> Vec<Peer> {
        self.shared.state.lock().unwrap().presence.peers()
    }

    /// Whether broadcasts currently go anywhere. Also true detached,
    /// where the session accepts edits and keeps them local.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Copy of the local document mirror.
    pub fn document(&self) -> Document {
        self.shared.state.lock().unwrap().reconciler.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn peer_id(&self) -> Uuid {
        self.shared.peer_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.shared.doc_id
    }

    pub fn profile(&self) -> PeerProfile {
        self.shared.profile.clone()
    }

    // ─── Teardown ───────────────────────────────────────────────────

    /// Leave the session deterministically.
    ///
    /// Announces departure, persists the mirror one last time, stops
    /// every background task, drops all callbacks and handlers, then
    /// closes the channel, draining the outbound queue so the goodbye
    /// actually reaches the relay.
    pub async fn leave(mut self) {
        if self.shared.connected.load(Ordering::SeqCst) {
            let bye = Envelope::peer_left(self.shared.peer_id, self.shared.doc_id);
            if let Err(e) = self.channel.send(bye) {
                log::warn!("Departure announcement failed: {e}");
            }
        }
        persist_snapshot(&self.shared);

        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.cursor_flush.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.seed_task.lock().unwrap().take() {
            task.abort();
        }
        {
            let mut st = self.shared.state.lock().unwrap();
            st.cursor_throttle.reset();
            st.entity_callbacks.clear();
            st.link_callbacks.clear();
        }
        for (kind, id) in self.handler_ids.drain(..) {
            self.channel.off(kind, id);
        }
        self.channel.disconnect().await;
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.cursor_flush.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.seed_task.lock().unwrap().take() {
            task.abort();
        }
        for (kind, id) in self.handler_ids.drain(..) {
            self.channel.off(kind, id);
        }
    }
}

// ─── Event handlers ─────────────────────────────────────────────────

fn register_handlers(
    channel: &Arc<DocChannel>,
    shared: &Arc<SessionShared>,
    seed_slot: &Arc<Mutex<Option<JoinHandle<()>>>>,
) -> Vec<(EventKind, HandlerId)> {
    let mut ids = Vec::new();

    // Connected: announce ourselves, ask for the document, and arm the
    // snapshot fallback in case nobody answers.
    {
        let shared = shared.clone();
        let channel = channel.clone();
        let seed_slot = seed_slot.clone();
        let id = channel.clone().on(EventKind::Connected, move |_| {
            shared.connected.store(true, Ordering::SeqCst);
            let hello = Envelope::peer_joined(shared.peer_id, shared.doc_id, &shared.profile);
            if let Err(e) = channel.send(hello) {
                log::error!("Join announcement failed: {e}");
            }
            let ask = Envelope::request_initial_state(shared.peer_id, shared.doc_id);
            if let Err(e) = channel.send(ask) {
                log::error!("State request failed: {e}");
            }
            if shared.store.is_some() {
                let task = tokio::spawn(seed_from_store(shared.clone()));
                if let Some(old) = seed_slot.lock().unwrap().replace(task) {
                    old.abort();
                }
            }
        });
        ids.push((EventKind::Connected, id));
    }

    // Disconnected: stop transmitting; a parked cursor must not fire
    // into a dead socket.
    {
        let shared = shared.clone();
        let id = channel.on(EventKind::Disconnected, move |_| {
            shared.connected.store(false, Ordering::SeqCst);
            shared.state.lock().unwrap().cursor_throttle.cancel();
            log::info!("Connection lost; edits stay local until resync");
        });
        ids.push((EventKind::Disconnected, id));
    }

    {
        let shared = shared.clone();
        let id = channel.on(EventKind::PeerJoined, move |env| match env.profile() {
            Ok(profile) => {
                let mut st = shared.state.lock().unwrap();
                st.presence.apply_join(env.peer_id, &profile, unix_millis());
            }
            Err(e) => log::warn!("Malformed join from {}: {e}", env.peer_id),
        });
        ids.push((EventKind::PeerJoined, id));
    }

    {
        let shared = shared.clone();
        let id = channel.on(EventKind::PeerLeft, move |env| {
            let gone = {
                let mut st = shared.state.lock().unwrap();
                st.presence.apply_leave(env.peer_id)
            };
            if let Some(peer) = gone {
                log::info!("Peer {} ({}) left", peer.name, peer.id);
            }
        });
        ids.push((EventKind::PeerLeft, id));
    }

    // A state request is answered only from a non-empty mirror; the
    // reply is addressed so bystanders ignore it.
    {
        let shared = shared.clone();
        let channel = channel.clone();
        let id = channel.clone().on(EventKind::RequestInitialState, move |env| {
            let answer = {
                let mut st = shared.state.lock().unwrap();
                st.presence.touch(env.peer_id, unix_millis());
                st.reconciler.answer_request(env.peer_id)
            };
            if let Some((entities, links)) = answer {
                let reply = Envelope::initial_state(
                    shared.peer_id,
                    shared.doc_id,
                    env.peer_id,
                    entities,
                    links,
                );
                if let Err(e) = channel.send(reply) {
                    log::error!("Initial state reply failed: {e}");
                }
            }
        });
        ids.push((EventKind::RequestInitialState, id));
    }

    // First addressed reply into an empty mirror wins; everything else
    // falls through silently.
    {
        let shared = shared.clone();
        let id = channel.on(EventKind::InitialState, move |env| {
            let payload = match env.snapshot() {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("Malformed initial state from {}: {e}", env.peer_id);
                    return;
                }
            };
            let adopted = {
                let mut st = shared.state.lock().unwrap();
                st.presence.touch(env.peer_id, unix_millis());
                if st.reconciler.accept_initial_state(
                    payload.to_peer,
                    payload.entities,
                    payload.links,
                    unix_millis(),
                ) {
                    let doc = st.reconciler.document();
                    Some((doc.entities.clone(), doc.links.clone()))
                } else {
                    None
                }
            };
            if let Some((entities, links)) = adopted {
                log::info!("Adopted initial state from {}", env.peer_id);
                notify_entities(&shared, &entities);
                notify_links(&shared, &links);
            }
        });
        ids.push((EventKind::InitialState, id));
    }

    {
        let shared = shared.clone();
        let id = channel.on(EventKind::CursorMove, move |env| match env.cursor() {
            Ok(payload) => {
                let mut st = shared.state.lock().unwrap();
                st.presence.apply_cursor(env.peer_id, payload.cursor, unix_millis());
            }
            Err(e) => log::warn!("Malformed cursor from {}: {e}", env.peer_id),
        });
        ids.push((EventKind::CursorMove, id));
    }

    {
        let shared = shared.clone();
        let id = channel.on(EventKind::EntityUpdate, move |env| {
            let entities = match env.updated_entities() {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("Malformed entity update from {}: {e}", env.peer_id);
                    return;
                }
            };
            let applied = {
                let mut st = shared.state.lock().unwrap();
                st.presence.touch(env.peer_id, unix_millis());
                match st
                    .reconciler
                    .apply_entity_update(env.peer_id, env.timestamp_ms, entities)
                {
                    ApplyOutcome::Applied => Some(st.reconciler.document().entities.clone()),
                    ApplyOutcome::Stale => {
                        log::debug!(
                            "Stale entity update from {} (stamp {} behind watermark)",
                            env.peer_id,
                            env.timestamp_ms
                        );
                        None
                    }
                    ApplyOutcome::OwnEcho => None,
                }
            };
            if let Some(entities) = applied {
                notify_entities(&shared, &entities);
            }
        });
        ids.push((EventKind::EntityUpdate, id));
    }

    {
        let shared = shared.clone();
        let id = channel.on(EventKind::LinkUpdate, move |env| {
            let links = match env.updated_links() {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("Malformed link update from {}: {e}", env.peer_id);
                    return;
                }
            };
            let applied = {
                let mut st = shared.state.lock().unwrap();
                st.presence.touch(env.peer_id, unix_millis());
                match st
                    .reconciler
                    .apply_link_update(env.peer_id, env.timestamp_ms, links)
                {
                    ApplyOutcome::Applied => Some(st.reconciler.document().links.clone()),
                    ApplyOutcome::Stale => {
                        log::debug!(
                            "Stale link update from {} (stamp {} behind watermark)",
                            env.peer_id,
                            env.timestamp_ms
                        );
                        None
                    }
                    ApplyOutcome::OwnEcho => None,
                }
            };
            if let Some(links) = applied {
                notify_links(&shared, &links);
            }
        });
        ids.push((EventKind::LinkUpdate, id));
    }

    ids
}

// ─── Background tasks ───────────────────────────────────────────────

/// Periodic roster sweep; eviction itself lives in the registry.
fn spawn_sweep(shared: Arc<SessionShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(shared.config.sweep_interval);
        loop {
            ticker.tick().await;
            let _ = {
                let mut st = shared.state.lock().unwrap();
                st.presence.evict_stale(unix_millis())
            };
        }
    })
}

/// Periodic snapshot of the mirror into the attached store.
fn spawn_persist(shared: Arc<SessionShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(shared.config.persist_interval);
        // The first tick fires immediately; nothing worth saving yet
        ticker.tick().await;
        loop {
            ticker.tick().await;
            persist_snapshot(&shared);
        }
    })
}

/// Adopt the persisted snapshot if the handshake produced nothing.
async fn seed_from_store(shared: Arc<SessionShared>) {
    tokio::time::sleep(shared.config.handshake_window).await;

    let store = match shared.store.clone() {
        Some(s) => s,
        None => return,
    };
    if !shared.state.lock().unwrap().reconciler.is_empty() {
        return; // a live peer answered first, or local edits exist
    }

    let doc = match store.load(shared.doc_id) {
        Ok(Some(doc)) => doc,
        Ok(None) => return,
        Err(e) => {
            log::error!("Snapshot load failed for {}: {e}", shared.doc_id);
            return;
        }
    };

    let (seeded, entities, links) = {
        let mut st = shared.state.lock().unwrap();
        let seeded = st.reconciler.seed(doc, unix_millis());
        let doc = st.reconciler.document();
        (seeded, doc.entities.clone(), doc.links.clone())
    };
    if seeded {
        log::info!("Document {} restored from local snapshot", shared.doc_id);
        notify_entities(&shared, &entities);
        notify_links(&shared, &links);
    }
}

fn persist_snapshot(shared: &SessionShared) {
    let store = match &shared.store {
        Some(s) => s,
        None => return,
    };
    let doc = shared.state.lock().unwrap().reconciler.snapshot();
    if doc.is_empty() {
        return; // an empty mirror never clobbers a saved diagram
    }
    match store.save(shared.doc_id, &doc) {
        Ok(()) => log::debug!("Snapshot saved for {}", shared.doc_id),
        Err(e) => log::error!("Snapshot save failed for {}: {e}", shared.doc_id),
    }
}

fn notify_entities(shared: &SessionShared, entities: &[Entity]) {
    let callbacks = shared.state.lock().unwrap().entity_callbacks.clone();
    for callback in callbacks {
        callback(entities);
    }
}

fn notify_links(shared: &SessionShared, links: &[Link]) {
    let callbacks = shared.state.lock().unwrap().link_callbacks.clone();
    for callback in callbacks {
        callback(links);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySnapshotStore;

    /// Nothing listens here; sessions degrade to detached instantly.
    fn test_config() -> SessionConfig {
        SessionConfig {
            relay_url: "ws://127.0.0.1:1".to_string(),
            handshake_window: Duration::from_millis(50),
            persist_interval: Duration::from_millis(100),
            ..SessionConfig::default()
        }
    }

    fn sample_entities() -> Vec<Entity> {
        vec![
            Entity::new("Usuario", Position::new(100.0, 80.0)),
            Entity::new("Pedido", Position::new(320.0, 80.0)),
        ]
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.relay_url, "ws://127.0.0.1:9090");
        assert_eq!(config.display_name, "Anonymous");
        assert_eq!(config.liveness_window, Duration::from_secs(30));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.cursor_interval, Duration::from_millis(33));
        assert_eq!(config.handshake_window, Duration::from_secs(2));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_detached_session_keeps_working() {
        let session = CollabSession::connect(Uuid::new_v4(), test_config()).await;

        assert_eq!(session.connection_state(), ConnectionState::Detached);
        // Detached still counts as ready: edits are accepted and cached.
        assert!(session.is_connected());
        assert!(session.peers().is_empty());

        let entities = sample_entities();
        session.broadcast_entity_update(entities.clone());
        session.broadcast_cursor_move(Position::new(5.0, 5.0));

        let doc = session.document();
        assert_eq!(doc.entities, entities);
        assert!(doc.links.is_empty());

        session.leave().await;
    }

    #[tokio::test]
    async fn test_detached_seed_from_store() {
        let doc_id = Uuid::new_v4();
        let store = Arc::new(MemorySnapshotStore::new());

        let mut saved = Document::new();
        saved.entities = sample_entities();
        store.preload(doc_id, saved.clone());

        let session =
            CollabSession::connect_with_store(doc_id, test_config(), store.clone()).await;

        let notified = Arc::new(AtomicBool::new(false));
        {
            let notified = notified.clone();
            session.on_entities_change(move |entities| {
                assert_eq!(entities.len(), 2);
                notified.store(true, Ordering::SeqCst);
            });
        }

        // Nobody can answer the handshake, so the store fallback lands
        // after the handshake window.
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(session.document(), saved);
        assert!(notified.load(Ordering::SeqCst));

        session.leave().await;
    }

    #[tokio::test]
    async fn test_local_edits_preempt_store_seed() {
        let doc_id = Uuid::new_v4();
        let store = Arc::new(MemorySnapshotStore::new());

        let mut saved = Document::new();
        saved.entities = vec![Entity::new("Archivado", Position::new(0.0, 0.0))];
        store.preload(doc_id, saved);

        let session =
            CollabSession::connect_with_store(doc_id, test_config(), store.clone()).await;

        // Edit before the handshake window closes...
        let fresh = vec![Entity::new("Recién creado", Position::new(50.0, 50.0))];
        session.broadcast_entity_update(fresh.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;

        // ...and the stale snapshot must not overwrite it.
        assert_eq!(session.document().entities, fresh);

        session.leave().await;
    }

    #[tokio::test]
    async fn test_leave_persists_mirror() {
        let doc_id = Uuid::new_v4();
        let store = Arc::new(MemorySnapshotStore::new());

        let session =
            CollabSession::connect_with_store(doc_id, test_config(), store.clone()).await;
        let entities = sample_entities();
        session.broadcast_entity_update(entities.clone());
        session.leave().await;

        let reloaded = store.load(doc_id).unwrap().unwrap();
        assert_eq!(reloaded.entities, entities);
    }

    #[tokio::test]
    async fn test_empty_mirror_is_not_persisted() {
        let doc_id = Uuid::new_v4();
        let store = Arc::new(MemorySnapshotStore::new());

        let mut saved = Document::new();
        saved.entities = sample_entities();
        store.preload(doc_id, saved.clone());

        // Join and leave immediately, before the seed fallback runs.
        let mut config = test_config();
        config.handshake_window = Duration::from_secs(30);
        let session = CollabSession::connect_with_store(doc_id, config, store.clone()).await;
        session.leave().await;

        // The untouched snapshot survives.
        assert_eq!(store.load(doc_id).unwrap().unwrap(), saved);
    }
}
