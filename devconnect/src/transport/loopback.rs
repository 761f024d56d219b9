//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to stand in for a server.
//! [`LoopbackConnector::new`] returns a connector and its [`LoopbackServer`];
//! every successful `connect()` hands the server one [`LoopbackPeer`], the
//! server-side end of that connection. Dropping the peer looks like a server
//! disconnect to the client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use super::{Connector, Transport, TransportError, TransportType};

/// In-process transport backed by `tokio::sync::mpsc` channels.
pub struct LoopbackTransport {
    /// Sender toward the server end; taken on close.
    tx: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
    /// Receiver for frames the server end sent.
    rx: Mutex<mpsc::Receiver<String>>,
    closed: AtomicBool,
}

/// Server-side end of one loopback connection.
pub struct LoopbackPeer {
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
}

impl LoopbackTransport {
    /// Create a connected client transport and its server-side peer.
    ///
    /// The `buffer` parameter controls the channel capacity for each
    /// direction.
    #[must_use]
    pub fn create_pair(buffer: usize) -> (Self, LoopbackPeer) {
        let (to_server, from_client) = mpsc::channel(buffer);
        let (to_client, from_server) = mpsc::channel(buffer);

        let client = Self {
            tx: parking_lot::Mutex::new(Some(to_server)),
            rx: Mutex::new(from_server),
            closed: AtomicBool::new(false),
        };
        let peer = LoopbackPeer {
            tx: to_client,
            rx: Mutex::new(from_client),
        };
        (client, peer)
    }
}

impl Transport for LoopbackTransport {
    async fn send(&self, frame: &str) -> Result<(), TransportError> {
        let tx = self.tx.lock().clone().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame.to_owned())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<String, TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.tx.lock().take();
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
            && self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

impl LoopbackPeer {
    /// Send a frame to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client transport
    /// has been dropped.
    pub async fn send(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        self.tx
            .send(frame.into())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next frame the client sent, or `None` once the client
    /// closed or dropped its transport.
    pub async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    /// Receive a frame without waiting.
    pub fn try_recv(&self) -> Option<String> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

struct ConnectorShared {
    accept_tx: mpsc::UnboundedSender<LoopbackPeer>,
    refusing: AtomicBool,
    buffer: usize,
}

/// Connector producing [`LoopbackTransport`]s.
#[derive(Clone)]
pub struct LoopbackConnector {
    shared: Arc<ConnectorShared>,
}

/// Accepts the server-side ends of loopback connections.
pub struct LoopbackServer {
    accept_rx: mpsc::UnboundedReceiver<LoopbackPeer>,
    shared: Arc<ConnectorShared>,
}

impl LoopbackConnector {
    /// Create a connector and the server that receives its connections.
    #[must_use]
    pub fn new(buffer: usize) -> (Self, LoopbackServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnectorShared {
            accept_tx,
            refusing: AtomicBool::new(false),
            buffer,
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            LoopbackServer { accept_rx, shared },
        )
    }
}

impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self) -> Result<LoopbackTransport, TransportError> {
        if self.shared.refusing.load(Ordering::Relaxed) {
            return Err(TransportError::Unreachable("loopback".to_string()));
        }
        let (client, peer) = LoopbackTransport::create_pair(self.shared.buffer);
        self.shared
            .accept_tx
            .send(peer)
            .map_err(|_| TransportError::Unreachable("loopback".to_string()))?;
        Ok(client)
    }
}

impl LoopbackServer {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.accept_rx.recv().await
    }

    /// Make subsequent `connect()` calls fail (or succeed again).
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::Relaxed);
    }
}
