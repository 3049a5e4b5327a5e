//! `Hearth` relay server.
//!
//! An axum WebSocket server that persists chat messages, assigns their
//! canonical ids and pushes changes to subscribed clients.
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin hearth-relay
//!
//! # Custom address and history cap
//! cargo run --bin hearth-relay -- --bind 127.0.0.1:8080 --max-history 1000
//! ```

use std::sync::Arc;

use clap::Parser;
use hearth_relay::config::{RelayCliArgs, RelayConfig};
use hearth_relay::relay::{self, RelayState};
use hearth_relay::store::HistoryStore;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        max_history = config.max_history,
        "starting hearth relay"
    );

    let store = HistoryStore::with_max_history(config.max_history);
    let state = Arc::new(RelayState::with_config(config.max_message_size, store));

    match relay::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    }
}
