//! Transport layer abstraction for the chat socket.
//!
//! Defines the [`Transport`] trait that carries encoded socket frames and the
//! [`Connector`] trait that opens new transports (used again on every
//! reconnect). Concrete implementations include:
//! - [`websocket::WebSocketConnector`]: persistent WebSocket stream (preferred)
//! - [`polling::PollingConnector`]: HTTP long-polling (fallback)
//! - [`hybrid::HybridConnector`]: tries a preferred connector, then a fallback
//! - [`loopback::LoopbackConnector`]: in-process channels for testing

pub mod hybrid;
pub mod loopback;
pub mod polling;
pub mod websocket;

use std::fmt;

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Persistent WebSocket stream.
    WebSocket,
    /// HTTP long-polling.
    Polling,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Polling => write!(f, "Polling"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The endpoint could not be reached.
    #[error("{0} is unreachable")]
    Unreachable(String),

    /// The endpoint answered, but not in the expected way.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async transport carrying encoded socket frames.
///
/// Frames are opaque JSON text to this layer; encoding and decoding happen
/// in the socket client.
pub trait Transport: Send + Sync {
    /// Send one frame.
    ///
    /// Returns `Ok(())` once the frame has been handed to the underlying
    /// connection. This does NOT guarantee the server processed it.
    fn send(
        &self,
        frame: &str,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next inbound frame.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the connection is
    /// gone and every buffered frame has been delivered.
    fn recv(&self) -> impl std::future::Future<Output = Result<String, TransportError>> + Send;

    /// Close the connection. Idempotent.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;

    /// Whether the connection is believed to be alive.
    fn is_connected(&self) -> bool;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}

/// Opens transports to one endpoint.
///
/// The socket client keeps its connector for the lifetime of the client and
/// calls [`Connector::connect`] again after every unexpected disconnect.
pub trait Connector: Send + Sync + 'static {
    /// The transport this connector produces.
    type Transport: Transport + 'static;

    /// Open a new connection.
    fn connect(
        &self,
    ) -> impl std::future::Future<Output = Result<Self::Transport, TransportError>> + Send;
}
