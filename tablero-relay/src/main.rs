//! Tablero relay — standalone WebSocket relay for collaborative editing.
//!
//! Routes envelopes between the peers of each document room and holds
//! no document state of its own. Bind address comes from the first
//! argument, then `TABLERO_RELAY_ADDR`, then the default.
//!
//! ```text
//! tablero-relay [bind_addr]
//! ```

use log::info;

use tablero_collab::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let bind_addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TABLERO_RELAY_ADDR").ok())
        .unwrap_or_else(|| RelayConfig::default().bind_addr);

    let relay = RelayServer::new(RelayConfig {
        bind_addr,
        ..RelayConfig::default()
    });

    info!("Tablero relay starting on {}", relay.bind_addr());
    if let Err(e) = relay.run().await {
        log::error!("Relay terminated: {e}");
        std::process::exit(1);
    }
}
