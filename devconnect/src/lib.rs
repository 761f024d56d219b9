//! `DevConnect` chat session engine.
//!
//! Pairs a socket message channel with REST-fetched history, reconciles
//! optimistic local echoes with server-confirmed messages, and manages the
//! connection lifecycle for one-to-one conversations.

pub mod chat;
pub mod config;
pub mod transport;
