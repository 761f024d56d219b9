//! HTTP long-polling transport (fallback strategy).
//!
//! Used when the WebSocket endpoint cannot be reached (proxies that strip
//! upgrade headers, restrictive networks). The exchange:
//!
//! 1. `POST {poll_path}` opens a session and returns `{"sid": ...}`.
//! 2. `GET {poll_path}/{sid}` is held open by the server until frames are
//!    available or its poll timeout elapses. The body carries zero or more
//!    frames separated by [`codec::RECORD_SEPARATOR`].
//! 3. `POST {poll_path}/{sid}` sends frames in the same encoding.
//! 4. `DELETE {poll_path}/{sid}` ends the session.
//!
//! A `404` or `410` for a session means the server dropped it; the transport
//! reports that as a disconnect so the socket client reconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use devconnect_proto::codec::{self, PollHandshake};
use reqwest::StatusCode;
use tokio::sync::{Mutex, mpsc};

use super::{Connector, Transport, TransportError, TransportType};

/// Default timeout for the handshake and send requests.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default server-side hold time the client expects for one poll.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(25);

/// Slack added on top of the poll timeout before the client gives up on a
/// single poll request.
const POLL_GRACE: Duration = Duration::from_secs(5);

/// Capacity of the inbound frame channel.
const INCOMING_BUFFER: usize = 256;

/// Opens [`PollingTransport`]s against an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct PollingConnector {
    endpoint: String,
    auth_token: Option<String>,
    client: reqwest::Client,
    request_timeout: Duration,
    poll_timeout: Duration,
}

impl PollingConnector {
    /// Create a connector for `base_url` joined with `path`
    /// (e.g. `http://localhost:7000` and `/socket/poll`).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Protocol`] if the URL is invalid.
    pub fn new(base_url: &str, path: &str) -> Result<Self, TransportError> {
        let endpoint = url::Url::parse(base_url)
            .and_then(|base| base.join(path))
            .map_err(|e| TransportError::Protocol(format!("invalid polling URL: {e}")))?;
        Ok(Self {
            endpoint: endpoint.as_str().trim_end_matches('/').to_string(),
            auth_token: None,
            client: reqwest::Client::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        })
    }

    /// Send `token` as the `token` cookie on every request.
    #[must_use]
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// Override the timeout for handshake and send requests.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the expected server-side poll hold time.
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// The polling endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Connector for PollingConnector {
    type Transport = PollingTransport;

    async fn connect(&self) -> Result<PollingTransport, TransportError> {
        let response = authorized(self.client.post(&self.endpoint), self.auth_token.as_deref())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_request_error(&self.endpoint, &e))?;

        if !response.status().is_success() {
            tracing::warn!(
                url = %self.endpoint,
                status = %response.status(),
                "polling handshake refused"
            );
            return Err(TransportError::Protocol(format!(
                "polling handshake refused: status {}",
                response.status()
            )));
        }

        let handshake: PollHandshake = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(format!("malformed polling handshake: {e}")))?;

        let session_url = format!("{}/{}", self.endpoint, handshake.sid);
        let (tx, rx) = mpsc::channel(INCOMING_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));

        let reader_handle = tokio::spawn(poll_loop(
            self.client.clone(),
            session_url.clone(),
            self.auth_token.clone(),
            self.poll_timeout + POLL_GRACE,
            tx,
            Arc::clone(&connected),
        ));

        tracing::info!(url = %session_url, "polling session opened");

        Ok(PollingTransport {
            client: self.client.clone(),
            session_url,
            auth_token: self.auth_token.clone(),
            request_timeout: self.request_timeout,
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }
}

/// Long-polling transport implementing the [`Transport`] trait.
pub struct PollingTransport {
    client: reqwest::Client,
    session_url: String,
    auth_token: Option<String>,
    request_timeout: Duration,
    /// Channel for frames received by the background poll task.
    incoming: Mutex<mpsc::Receiver<String>>,
    /// Whether the polling session is active.
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl PollingTransport {
    /// URL of this polling session.
    #[must_use]
    pub fn session_url(&self) -> &str {
        &self.session_url
    }
}

impl Transport for PollingTransport {
    async fn send(&self, frame: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }

        let response = authorized(self.client.post(&self.session_url), self.auth_token.as_deref())
            .timeout(self.request_timeout)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(frame.to_owned())
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "polling send failed");
                map_request_error(&self.session_url, &e)
            })?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                self.connected.store(false, Ordering::Relaxed);
                Err(TransportError::ConnectionClosed)
            }
            s => Err(TransportError::Protocol(format!("polling send refused: status {s}"))),
        }
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        if !self.connected.swap(false, Ordering::Relaxed) {
            return;
        }
        self.reader_handle.abort();
        let result = authorized(self.client.delete(&self.session_url), self.auth_token.as_deref())
            .timeout(self.request_timeout)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(err = %e, "polling session delete failed");
        }
        tracing::info!(url = %self.session_url, "polling session closed");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Polling
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Background task that keeps one poll request outstanding at all times.
async fn poll_loop(
    client: reqwest::Client,
    session_url: String,
    auth_token: Option<String>,
    hold_timeout: Duration,
    tx: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
) {
    'session: loop {
        let result = authorized(client.get(&session_url), auth_token.as_deref())
            .timeout(hold_timeout)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                tracing::warn!(err = %e, "poll request failed");
                break;
            }
        };

        match response.status() {
            StatusCode::NO_CONTENT => {}
            s if s.is_success() => {
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(err = %e, "poll body read failed");
                        break;
                    }
                };
                for frame in codec::split_batch(&body) {
                    if tx.send(frame.to_owned()).await.is_err() {
                        break 'session;
                    }
                }
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                tracing::info!(url = %session_url, "polling session ended by server");
                break;
            }
            s => {
                tracing::warn!(status = %s, "unexpected poll status");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("poll task exiting");
}

/// Attach the `token` cookie when one is configured.
fn authorized(builder: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => builder.header(reqwest::header::COOKIE, format!("token={token}")),
        None => builder,
    }
}

fn map_request_error(url: &str, err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Unreachable(url.to_string())
    } else {
        TransportError::Protocol(err.to_string())
    }
}
