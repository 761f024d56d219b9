//! Relay server core: shared state, socket handlers, room broadcast, and
//! the REST endpoints.
//!
//! Every authenticated socket connection (WebSocket or long-polling
//! session) gets a [`ConnId`] and an outbound channel. `joinChat` puts the
//! connection in the room of its conversation; `sendMessage` stores the
//! message and broadcasts `messageReceived` to everyone in that room,
//! including the sender, which is how clients learn the server id of their
//! own messages.
//!
//! Authentication is a development stand-in: the `token` cookie (or a
//! bearer token) is taken as the user id.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use devconnect_proto::codec::{self, PollHandshake};
use devconnect_proto::event::{
    ErrorPayload, OutgoingMessage, ReceivedMessage, SenderRef, SocketEvent,
};
use devconnect_proto::history::{ChatHistoryResponse, ChatListResponse, HistoryEntry};
use devconnect_proto::message::{ConversationKey, UserId, validate_text};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use crate::config::RelayConfig;
use crate::polling::{PollOutcome, PollRegistry};
use crate::rooms::{ConnId, RoomRegistry};
use crate::store::ConversationStore;

/// Default maximum message length in characters.
const DEFAULT_MAX_TEXT_LEN: usize = 500;

/// Default hold time of a long-poll request.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(25);

/// Polling sessions silent for this many poll timeouts are dropped.
const POLL_IDLE_FACTOR: u32 = 3;

/// Item queued for delivery to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An encoded socket event.
    Frame(String),
    /// Ask the transport to close the connection.
    Close,
}

struct Connection {
    user: UserId,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Shared relay server state.
pub struct RelayState {
    connections: RwLock<HashMap<ConnId, Connection>>,
    next_conn: AtomicU64,
    /// Conversation rooms.
    pub rooms: RoomRegistry,
    /// Message history and profiles.
    pub store: ConversationStore,
    /// Long-polling sessions.
    pub polls: PollRegistry,
    max_text_len: usize,
    poll_timeout: Duration,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay state with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(
            ConversationStore::new(),
            DEFAULT_MAX_TEXT_LEN,
            DEFAULT_POLL_TIMEOUT,
        )
    }

    /// Creates a relay state from a resolved [`RelayConfig`].
    #[must_use]
    pub fn with_config(config: &RelayConfig) -> Self {
        Self::with_parts(
            ConversationStore::with_max_history(config.max_history),
            config.max_text_len,
            config.poll_timeout,
        )
    }

    fn with_parts(store: ConversationStore, max_text_len: usize, poll_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            rooms: RoomRegistry::new(),
            store,
            polls: PollRegistry::new(),
            max_text_len,
            poll_timeout,
        }
    }

    /// Registers a new connection for `user`, returning its id and the
    /// receiving half of its outbound channel.
    pub async fn connect(&self, user: &UserId) -> (ConnId, mpsc::UnboundedReceiver<Outbound>) {
        let conn = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(
            conn,
            Connection {
                user: user.clone(),
                tx,
            },
        );
        tracing::info!(conn = %conn, user = %user, "connection registered");
        (conn, rx)
    }

    /// Removes a connection and takes it out of every room.
    ///
    /// Returns `false` if the connection was already gone.
    pub async fn disconnect(&self, conn: ConnId) -> bool {
        let removed = self.connections.write().await.remove(&conn);
        let rooms = self.rooms.leave_all(conn).await;
        if let Some(connection) = &removed {
            tracing::info!(conn = %conn, user = %connection.user, rooms, "connection removed");
        }
        removed.is_some()
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Asks every connection to close.
    ///
    /// WebSocket connections receive a close frame; polling sessions end
    /// with `410 Gone` on their next poll. Useful for graceful shutdown and
    /// for exercising client reconnects.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (conn, connection) in conns.iter() {
            tracing::info!(conn = %conn, user = %connection.user, "closing connection");
            let _ = connection.tx.send(Outbound::Close);
        }
    }

    async fn send_to(&self, conn: ConnId, frame: String) {
        let conns = self.connections.read().await;
        if let Some(connection) = conns.get(&conn)
            && connection.tx.send(Outbound::Frame(frame)).is_err()
        {
            tracing::debug!(conn = %conn, "outbound channel closed");
        }
    }

    /// Sends `event` to every connection in room `key`, returning how many
    /// connections it was queued for.
    pub async fn broadcast(&self, key: &ConversationKey, event: &SocketEvent) -> usize {
        let frame = match codec::encode(event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, event = event.name(), "failed to encode event");
                return 0;
            }
        };
        let members = self.rooms.members(key).await;
        let conns = self.connections.read().await;
        members
            .iter()
            .filter_map(|conn| conns.get(conn))
            .filter(|connection| connection.tx.send(Outbound::Frame(frame.clone())).is_ok())
            .count()
    }

    async fn send_error(&self, conn: ConnId, message: impl Into<String>) {
        let event = SocketEvent::Error(ErrorPayload {
            message: message.into(),
        });
        if let Ok(frame) = codec::encode(&event) {
            self.send_to(conn, frame).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Socket event handling (shared by both transports)
// ---------------------------------------------------------------------------

/// Handles one inbound text frame from an authenticated connection.
pub async fn handle_frame(state: &RelayState, conn: ConnId, user: &UserId, frame: &str) {
    let event = match codec::decode(frame) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(conn = %conn, error = %e, "failed to decode frame");
            state.send_error(conn, "malformed event").await;
            return;
        }
    };

    match event {
        SocketEvent::JoinChat(join) => {
            if &join.user_id != user {
                tracing::warn!(
                    conn = %conn,
                    user = %user,
                    claimed = %join.user_id,
                    "join refused for another user"
                );
                state.send_error(conn, "cannot join as another user").await;
                return;
            }
            state
                .store
                .remember_profile(user, join.first_name, None)
                .await;
            let key = ConversationKey::for_pair(user, &join.target_user_id);
            let added = state.rooms.join(&key, conn).await;
            tracing::info!(conn = %conn, room = %key, added, "joined chat");
        }
        SocketEvent::SendMessage(message) => {
            handle_send(state, conn, user, message).await;
        }
        other => {
            tracing::warn!(conn = %conn, event = other.name(), "unexpected event from client");
        }
    }
}

async fn handle_send(state: &RelayState, conn: ConnId, user: &UserId, message: OutgoingMessage) {
    // The authenticated user is the sender whatever the payload claims.
    if &message.user_id != user {
        tracing::warn!(
            conn = %conn,
            user = %user,
            claimed = %message.user_id,
            "overriding claimed sender"
        );
    }

    let text = match validate_text(&message.text, Some(state.max_text_len)) {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!(conn = %conn, error = %e, "message rejected");
            state.send_error(conn, e.to_string()).await;
            return;
        }
    };

    state
        .store
        .remember_profile(user, message.first_name, message.last_name)
        .await;
    let stored = state.store.append(user, &message.target_user_id, text).await;
    let profile = state.store.profile(user).await;

    let event = SocketEvent::MessageReceived(ReceivedMessage {
        id: Some(stored.id),
        user_id: Some(user.clone()),
        first_name: profile.first_name.clone(),
        last_name: profile.last_name.clone(),
        sender_id: Some(SenderRef::Profile(profile)),
        text: Some(stored.text),
        created_at: Some(stored.created_at),
        client_message_id: message.client_message_id,
    });
    let key = ConversationKey::for_pair(user, &message.target_user_id);
    let delivered = state.broadcast(&key, &event).await;
    tracing::debug!(conn = %conn, room = %key, delivered, "message relayed");
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// Handles an upgraded WebSocket connection for an authenticated user.
///
/// A writer task drains the connection's outbound channel into the socket
/// while the reader task feeds inbound text frames to [`handle_frame`].
/// When either side ends, the other is aborted and the connection leaves
/// its rooms.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>, user: UserId) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (conn, mut rx) = state.connect(&user).await;

    let mut write_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                        tracing::warn!(conn = %conn, "WebSocket write failed");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let reader_user = user.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_frame(&reader_state, conn, &reader_user, text.as_str()).await;
                }
                Message::Close(_) => {
                    tracing::info!(conn = %conn, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.disconnect(conn).await;
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Response {
    let Some(user) = authenticate(&headers) else {
        return unauthorized();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

// ---------------------------------------------------------------------------
// Long-polling transport
// ---------------------------------------------------------------------------

async fn poll_open(State(state): State<Arc<RelayState>>, headers: HeaderMap) -> Response {
    let Some(user) = authenticate(&headers) else {
        return unauthorized();
    };
    let (conn, rx) = state.connect(&user).await;
    let sid = state.polls.create(conn, user, rx).await;
    tracing::info!(conn = %conn, sid = %sid, "polling session opened");
    Json(PollHandshake { sid }).into_response()
}

async fn poll_receive(
    State(state): State<Arc<RelayState>>,
    Path(sid): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(user) = authenticate(&headers) else {
        return unauthorized();
    };
    let Some(session) = state.polls.get(&sid).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if session.user != user {
        return unauthorized();
    }

    match session.poll(state.poll_timeout).await {
        PollOutcome::Empty => StatusCode::NO_CONTENT.into_response(),
        PollOutcome::Frames(frames) => {
            if session.is_closed() {
                state.disconnect(session.conn).await;
            }
            (
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                codec::encode_batch(&frames),
            )
                .into_response()
        }
        PollOutcome::Closed => {
            state.disconnect(session.conn).await;
            StatusCode::GONE.into_response()
        }
    }
}

async fn poll_send(
    State(state): State<Arc<RelayState>>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(user) = authenticate(&headers) else {
        return unauthorized();
    };
    let Some(session) = state.polls.get(&sid).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if session.user != user {
        return unauthorized();
    }
    if session.is_closed() {
        return StatusCode::GONE.into_response();
    }

    session.touch().await;
    for frame in codec::split_batch(&body) {
        handle_frame(&state, session.conn, &user, frame).await;
    }
    StatusCode::OK.into_response()
}

async fn poll_close(
    State(state): State<Arc<RelayState>>,
    Path(sid): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(user) = authenticate(&headers) else {
        return unauthorized();
    };
    match state.polls.get(&sid).await {
        Some(session) if session.user == user => {
            state.polls.remove(&sid).await;
            session.close();
            state.disconnect(session.conn).await;
            tracing::info!(conn = %session.conn, sid = %sid, "polling session closed by client");
            StatusCode::OK.into_response()
        }
        Some(_) => unauthorized(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Drops polling sessions whose client went away without `DELETE`.
async fn sweep_idle_polls(state: Arc<RelayState>) {
    let idle = state.poll_timeout * POLL_IDLE_FACTOR;
    let mut interval = tokio::time::interval(state.poll_timeout.max(Duration::from_secs(1)));
    loop {
        interval.tick().await;
        for session in state.polls.sweep(idle).await {
            tracing::info!(conn = %session.conn, "dropping idle polling session");
            state.disconnect(session.conn).await;
        }
    }
}

// ---------------------------------------------------------------------------
// REST endpoints
// ---------------------------------------------------------------------------

async fn chat_history(
    State(state): State<Arc<RelayState>>,
    Path(peer): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(user) = authenticate(&headers) else {
        return unauthorized();
    };
    let peer = UserId::new(peer);
    let messages = state
        .store
        .history(&user, &peer)
        .await
        .into_iter()
        .map(|m| HistoryEntry {
            id: Some(m.id),
            sender_id: Some(SenderRef::Id(m.sender)),
            text: Some(m.text),
            created_at: Some(m.created_at),
        })
        .collect::<Vec<_>>();
    tracing::debug!(user = %user, peer = %peer, count = messages.len(), "history served");

    Json(ChatHistoryResponse {
        success: true,
        other_user: Some(state.store.profile(&peer).await),
        messages,
        message: None,
    })
    .into_response()
}

async fn chat_list(State(state): State<Arc<RelayState>>, headers: HeaderMap) -> Response {
    let Some(user) = authenticate(&headers) else {
        return unauthorized();
    };
    let mut chats = state.store.conversations_for(&user).await;
    chats.sort_by_key(|c| std::cmp::Reverse(c.activity_at()));
    Json(ChatListResponse {
        success: true,
        chats,
    })
    .into_response()
}

/// Extracts the user from the `token` cookie or a bearer token.
fn authenticate(headers: &HeaderMap) -> Option<UserId> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "token")
        .map(|(_, value)| value.trim().to_string());

    let from_bearer = || {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.trim().to_string())
    };

    from_cookie
        .or_else(from_bearer)
        .filter(|token| !token.is_empty())
        .map(UserId::new)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "success": false, "message": "Not authorized" })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Builds the relay router.
pub fn router(state: Arc<RelayState>) -> axum::Router {
    axum::Router::new()
        .route("/socket/ws", get(ws_handler))
        .route("/socket/poll", post(poll_open))
        .route(
            "/socket/poll/{sid}",
            get(poll_receive).post(poll_send).delete(poll_close),
        )
        .route("/chat/{peer}", get(chat_history))
        .route("/chats", get(chat_list))
        .with_state(state)
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// The returned task also sweeps idle polling sessions; aborting it stops
/// both.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        tokio::select! {
            result = axum::serve(listener, app).into_future() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "relay server error");
                }
            }
            () = sweep_idle_polls(state) => {}
        }
    });

    Ok((bound_addr, handle))
}
