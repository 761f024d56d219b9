//! Wire contract for the `DevConnect` chat backend.
//!
//! Shared by the client engine and the development relay: identifiers,
//! timestamps, socket events, REST payloads, and the JSON text-frame codec.

pub mod codec;
pub mod event;
pub mod history;
pub mod message;
