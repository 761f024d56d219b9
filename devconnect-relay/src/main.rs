//! `DevConnect` development relay.
//!
//! An axum server implementing the chat backend's wire contract: the
//! history and inbox REST endpoints plus the socket events over WebSocket
//! and long-polling. Messages live in memory only.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:7000
//! cargo run --bin devconnect-relay
//!
//! # Run on custom address
//! cargo run --bin devconnect-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! DEVCONNECT_RELAY_ADDR=127.0.0.1:8080 cargo run --bin devconnect-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use devconnect_relay::config::{RelayCliArgs, RelayConfig};
use devconnect_relay::relay::{self, RelayState};

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
        max_text_len = config.max_text_len,
        "starting devconnect relay"
    );

    let state = Arc::new(RelayState::with_config(&config));

    match relay::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
