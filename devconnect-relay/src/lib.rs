//! `DevConnect` development relay library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! implements the chat wire contract: REST history and inbox endpoints,
//! socket rooms keyed by conversation, and WebSocket plus long-polling
//! transports for the socket events.

pub mod config;
pub mod polling;
pub mod relay;
pub mod rooms;
pub mod store;
