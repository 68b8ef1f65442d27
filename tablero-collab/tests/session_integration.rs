//! Integration tests for full collaboration sessions.
//!
//! These start a real relay and drive real sessions through the join
//! handshake, update propagation, presence, eviction, and snapshot
//! persistence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tablero_collab::channel::{ChannelConfig, DocChannel};
use tablero_collab::protocol::{unix_millis, Envelope, PeerProfile};
use tablero_collab::relay::{RelayConfig, RelayServer};
use tablero_collab::session::{CollabSession, SessionConfig};
use tablero_collab::store::{RocksSnapshotStore, StoreConfig};
use tablero_core::{Entity, Link, LinkKind, Position};
use tokio::time::Duration;
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return its client URL.
async fn start_relay() -> String {
    let port = free_port().await;
    let relay = RelayServer::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        room_capacity: 64,
    });
    tokio::spawn(async move {
        relay.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

fn session_config(url: &str, name: &str) -> SessionConfig {
    SessionConfig {
        relay_url: url.to_string(),
        display_name: name.to_string(),
        handshake_window: Duration::from_millis(400),
        ..SessionConfig::default()
    }
}

/// Poll until `check` passes or a few seconds elapse.
async fn eventually<F: Fn() -> bool>(check: F, what: &str) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    panic!("Timed out waiting for {what}");
}

fn sample_document() -> (Vec<Entity>, Vec<Link>) {
    let usuario = Entity::new("Usuario", Position::new(100.0, 80.0))
        .with_attributes(vec!["nombre: String".into(), "email: String".into()]);
    let pedido = Entity::new("Pedido", Position::new(340.0, 80.0))
        .with_attributes(vec!["total: f64".into()]);
    let contiene = Link::new(usuario.id, pedido.id, LinkKind::Association)
        .with_cardinality("1", "0..*")
        .with_name("realiza");
    (vec![usuario, pedido], vec![contiene])
}

#[tokio::test]
async fn test_join_handshake_transfers_document() {
    let url = start_relay().await;
    let doc_id = Uuid::new_v4();

    let alicia = CollabSession::connect(doc_id, session_config(&url, "Alicia")).await;
    assert!(alicia.is_connected());

    let (entities, links) = sample_document();
    alicia.broadcast_entity_update(entities.clone());
    alicia.broadcast_link_update(links.clone());

    let benito = CollabSession::connect(doc_id, session_config(&url, "Benito")).await;
    let entities_notified = Arc::new(AtomicBool::new(false));
    let links_notified = Arc::new(AtomicBool::new(false));
    {
        let flag = entities_notified.clone();
        benito.on_entities_change(move |_| flag.store(true, Ordering::SeqCst));
        let flag = links_notified.clone();
        benito.on_links_change(move |_| flag.store(true, Ordering::SeqCst));
    }

    eventually(
        || benito.document() == alicia.document(),
        "the handshake to copy the document",
    )
    .await;

    let doc = benito.document();
    assert_eq!(doc.entities, entities);
    assert_eq!(doc.links, links);
    assert!(entities_notified.load(Ordering::SeqCst));
    assert!(links_notified.load(Ordering::SeqCst));

    benito.leave().await;
    alicia.leave().await;
}

#[tokio::test]
async fn test_roster_tracks_join_and_leave() {
    let url = start_relay().await;
    let doc_id = Uuid::new_v4();

    let alicia = CollabSession::connect(doc_id, session_config(&url, "Alicia")).await;
    let benito = CollabSession::connect(doc_id, session_config(&url, "Benito")).await;

    eventually(
        || alicia.peers().iter().any(|p| p.name == "Benito"),
        "Alicia to see Benito join",
    )
    .await;
    let roster = alicia.peers();
    assert_eq!(roster.len(), 1);
    assert!(!roster[0].color.is_empty());
    assert!(roster[0].cursor.is_none());

    benito.leave().await;
    eventually(
        || alicia.peers().is_empty(),
        "Alicia to see Benito leave",
    )
    .await;

    alicia.leave().await;
}

#[tokio::test]
async fn test_cursor_appears_in_roster() {
    let url = start_relay().await;
    let doc_id = Uuid::new_v4();

    let alicia = CollabSession::connect(doc_id, session_config(&url, "Alicia")).await;
    let benito = CollabSession::connect(doc_id, session_config(&url, "Benito")).await;

    eventually(
        || alicia.peers().iter().any(|p| p.name == "Benito"),
        "Alicia to see Benito join",
    )
    .await;

    benito.broadcast_cursor_move(Position::new(120.0, 64.0));

    eventually(
        || {
            alicia
                .peers()
                .first()
                .and_then(|p| p.cursor)
                .map(|c| c == Position::new(120.0, 64.0))
                .unwrap_or(false)
        },
        "Benito's cursor to reach Alicia's roster",
    )
    .await;

    benito.leave().await;
    alicia.leave().await;
}

#[tokio::test]
async fn test_latest_edit_wins_in_both_directions() {
    let url = start_relay().await;
    let doc_id = Uuid::new_v4();

    let alicia = CollabSession::connect(doc_id, session_config(&url, "Alicia")).await;
    let benito = CollabSession::connect(doc_id, session_config(&url, "Benito")).await;

    alicia.broadcast_entity_update(vec![Entity::new("Usuario", Position::new(0.0, 0.0))]);
    eventually(
        || benito.document().entities.len() == 1,
        "Benito to receive Alicia's edit",
    )
    .await;

    let mut entities = benito.document().entities;
    entities.push(Entity::new("Pedido", Position::new(200.0, 0.0)));
    benito.broadcast_entity_update(entities);

    eventually(
        || alicia.document().entities.len() == 2,
        "Alicia to receive Benito's later edit",
    )
    .await;
    let names: Vec<String> = alicia
        .document()
        .entities
        .iter()
        .map(|e| e.name.clone())
        .collect();
    assert!(names.contains(&"Usuario".to_string()));
    assert!(names.contains(&"Pedido".to_string()));

    benito.leave().await;
    alicia.leave().await;
}

#[tokio::test]
async fn test_silent_peer_is_evicted() {
    let url = start_relay().await;
    let doc_id = Uuid::new_v4();

    let mut config = session_config(&url, "Alicia");
    config.liveness_window = Duration::from_millis(400);
    config.sweep_interval = Duration::from_millis(100);
    let alicia = CollabSession::connect(doc_id, config).await;

    // A raw channel that announces itself and then never speaks again.
    let ghost = DocChannel::new(
        Uuid::new_v4(),
        doc_id,
        ChannelConfig {
            url: url.clone(),
            ..ChannelConfig::default()
        },
    );
    ghost.connect().await;
    ghost
        .send(Envelope::peer_joined(
            ghost.peer_id(),
            doc_id,
            &PeerProfile::new("Fantasma", "#64748b"),
        ))
        .unwrap();

    eventually(
        || alicia.peers().iter().any(|p| p.name == "Fantasma"),
        "the ghost to appear",
    )
    .await;
    eventually(|| alicia.peers().is_empty(), "the ghost to be evicted").await;

    ghost.disconnect().await;
    alicia.leave().await;
}

#[tokio::test]
async fn test_update_from_unannounced_peer_still_applies() {
    let url = start_relay().await;
    let doc_id = Uuid::new_v4();

    let alicia = CollabSession::connect(doc_id, session_config(&url, "Alicia")).await;

    // No peer_joined first: the document update must apply anyway, and
    // the roster must not invent a record for the stranger.
    let ghost = DocChannel::new(
        Uuid::new_v4(),
        doc_id,
        ChannelConfig {
            url: url.clone(),
            ..ChannelConfig::default()
        },
    );
    ghost.connect().await;
    ghost
        .send(Envelope::entity_update(
            ghost.peer_id(),
            doc_id,
            unix_millis(),
            vec![Entity::new("Sorpresa", Position::new(10.0, 10.0))],
        ))
        .unwrap();

    eventually(
        || alicia.document().entities.len() == 1,
        "the update to apply",
    )
    .await;
    assert_eq!(alicia.document().entities[0].name, "Sorpresa");
    assert!(alicia.peers().is_empty());

    ghost.disconnect().await;
    alicia.leave().await;
}

#[tokio::test]
async fn test_snapshot_survives_session_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        RocksSnapshotStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap(),
    );
    let doc_id = Uuid::new_v4();

    // No relay anywhere: both sessions run detached on the store alone.
    let config = SessionConfig {
        relay_url: "ws://127.0.0.1:1".to_string(),
        handshake_window: Duration::from_millis(100),
        ..SessionConfig::default()
    };

    let first = CollabSession::connect_with_store(doc_id, config.clone(), store.clone()).await;
    let (entities, links) = sample_document();
    first.broadcast_entity_update(entities.clone());
    first.broadcast_link_update(links.clone());
    first.leave().await;

    let second = CollabSession::connect_with_store(doc_id, config, store.clone()).await;
    eventually(
        || second.document().entities.len() == 2,
        "the snapshot to seed the new session",
    )
    .await;
    let doc = second.document();
    assert_eq!(doc.entities, entities);
    assert_eq!(doc.links, links);

    second.leave().await;
}
