//! WebSocket transport (preferred strategy).
//!
//! Opens a WebSocket to the backend's socket endpoint, authenticating with
//! the `token` cookie, and carries one socket event per text frame. A
//! background reader task pushes inbound frames into a channel so `recv`
//! and `send` never contend for the stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Connector, Transport, TransportError, TransportType};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for opening the WebSocket.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the inbound frame channel.
const INCOMING_BUFFER: usize = 256;

/// Opens [`WebSocketTransport`]s to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    auth_token: Option<String>,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector for `url` (`ws://` or `wss://`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Send `token` as the `token` cookie on the upgrade request.
    #[must_use]
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// Override the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The URL this connector dials.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn connect(&self) -> Result<WebSocketTransport, TransportError> {
        WebSocketTransport::connect(&self.url, self.auth_token.as_deref(), self.connect_timeout)
            .await
    }
}

/// WebSocket transport implementing the [`Transport`] trait.
pub struct WebSocketTransport {
    /// The socket URL (ws:// or wss://).
    url: String,
    /// Write half of the WebSocket connection (shared for concurrent sends).
    ws_sender: Arc<Mutex<WsSender>>,
    /// Channel for frames received by the background reader task.
    incoming: Mutex<mpsc::Receiver<String>>,
    /// Whether the WebSocket connection is active.
    connected: Arc<AtomicBool>,
    /// Handle to the background reader task.
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WebSocketTransport {
    /// Open a WebSocket to `url`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the handshake does not finish in time.
    /// - [`TransportError::Unreachable`] if nothing is listening at `url`.
    /// - [`TransportError::Protocol`] if the server refuses the upgrade.
    pub async fn connect(
        url: &str,
        auth_token: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut request = url.into_client_request().map_err(map_ws_connect_error)?;
        if let Some(token) = auth_token {
            let cookie = HeaderValue::from_str(&format!("token={token}"))
                .map_err(|e| TransportError::Protocol(format!("invalid auth token: {e}")))?;
            request.headers_mut().insert(header::COOKIE, cookie);
        }

        let (ws_stream, _response) = tokio::time::timeout(connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                tracing::warn!(url, "WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "WebSocket connect failed");
                map_ws_connect_error(e)
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();

        let (tx, rx) = mpsc::channel(INCOMING_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        tracing::info!(url, "WebSocket connected");

        Ok(Self {
            url: url.to_string(),
            ws_sender: Arc::new(Mutex::new(ws_sender)),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }

    /// Return the URL this transport is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    async fn send(&self, frame: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut sender = self.ws_sender.lock().await;
        sender
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "WebSocket send failed");
                self.connected.store(false, Ordering::Relaxed);
                TransportError::ConnectionClosed
            })
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        if !self.connected.swap(false, Ordering::Relaxed) {
            return;
        }
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.close().await {
            tracing::debug!(err = %e, "WebSocket close handshake failed");
        }
        self.reader_handle.abort();
        tracing::info!(url = %self.url, "WebSocket closed");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Background task that forwards inbound text frames to `tx`.
///
/// Binary frames carrying valid UTF-8 are forwarded as text; anything else
/// is skipped. Sets `connected` to `false` when the stream ends.
async fn reader_loop(mut ws_reader: WsReader, tx: mpsc::Sender<String>, connected: Arc<AtomicBool>) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if tx.send(text.as_str().to_owned()).await.is_err() {
                    // Receiver dropped: transport was dropped.
                    break;
                }
            }
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => {
                    if tx.send(text).await.is_err() {
                        break;
                    }
                }
                Err(_) => tracing::warn!(len = data.len(), "non-UTF-8 binary frame, skipping"),
            },
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("WebSocket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable("socket endpoint".to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => {
            TransportError::Protocol(format!("upgrade refused: status {}", response.status()))
        }
        WsError::Url(e) => TransportError::Protocol(format!("invalid socket URL: {e}")),
        other => TransportError::Protocol(format!("WebSocket error: {other}")),
    }
}
