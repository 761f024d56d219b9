//! Socket client for one conversation.
//!
//! [`ChatSocketClient`] owns the lifecycle of the bidirectional channel:
//! connect, join the conversation's room, send, receive, disconnect, and
//! reconnect after unexpected drops. It holds at most one transport at a
//! time and never shares it.
//!
//! # Connection states
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!      ^                          |                  |
//!      |<---------error-----------+            transport drop
//!      |                                             v
//!      +<--attempts exhausted-- Reconnecting <-------+
//!                                    |
//!                                    +--ok (joinChat re-sent)--> Connected
//! ```
//!
//! `disconnect()` moves to `Disconnected` from any state and is final.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use devconnect_proto::codec::{self, CodecError};
use devconnect_proto::event::{JoinChat, OutgoingMessage, ReceivedMessage, SocketEvent};
use devconnect_proto::message::{ConversationKey, MessageId, Timestamp, UserId};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::message::{DeliveryState, Message, Participant};
use super::reconciler::RemoteMessage;
use crate::transport::{Connector, Transport, TransportError, TransportType};

/// Connection lifecycle state, owned by the socket client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection, and none being attempted.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connected and joined to the room.
    Connected,
    /// Connection lost; retrying with backoff.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Backoff policy for automatic reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
    /// Give up after this many attempts (`None` retries forever).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Errors returned by [`ChatSocketClient`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// The client is not in the `Connected` state.
    #[error("not connected")]
    NotConnected,

    /// The client has been disconnected for good.
    #[error("socket client is closed")]
    Closed,

    /// The client is already bound to another conversation.
    #[error("already bound to conversation {0}")]
    AlreadyBound(ConversationKey),

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A frame could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

type MessageHandler = Arc<dyn Fn(RemoteMessage) + Send + Sync>;

/// The pair a client is joined for.
#[derive(Debug, Clone)]
struct Binding {
    local: Participant,
    peer: UserId,
}

impl Binding {
    fn conversation_key(&self) -> ConversationKey {
        ConversationKey::for_pair(&self.local.id, &self.peer)
    }

    fn join_event(&self) -> SocketEvent {
        SocketEvent::JoinChat(JoinChat {
            user_id: self.local.id.clone(),
            target_user_id: self.peer.clone(),
            first_name: self.local.first_name.clone(),
        })
    }
}

struct Inner<C: Connector> {
    connector: C,
    reconnect: ReconnectConfig,
    state: watch::Sender<ConnectionState>,
    transport: parking_lot::Mutex<Option<Arc<C::Transport>>>,
    handlers: parking_lot::Mutex<Vec<MessageHandler>>,
    binding: parking_lot::Mutex<Option<Binding>>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    /// Serializes `connect()` calls.
    connect_lock: tokio::sync::Mutex<()>,
}

impl<C: Connector> Inner<C> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "connection state changed");
        }
    }

    async fn send_join(&self, transport: &C::Transport) -> Result<(), SocketError> {
        let binding = self.binding.lock().clone().ok_or(SocketError::NotConnected)?;
        let frame = codec::encode(&binding.join_event())?;
        transport.send(&frame).await?;
        tracing::info!(
            room = %binding.conversation_key(),
            transport = %transport.transport_type(),
            "joined chat room"
        );
        Ok(())
    }

    /// Decode one inbound frame and hand it to the registered handlers.
    fn dispatch(&self, frame: &str) {
        if self.is_closed() {
            return;
        }
        let event = match codec::decode(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(err = %e, "dropping malformed socket frame");
                return;
            }
        };
        match event {
            SocketEvent::MessageReceived(payload) => {
                let Some(binding) = self.binding.lock().clone() else {
                    return;
                };
                let Some(remote) = normalize_incoming(payload, &binding.local, &binding.peer)
                else {
                    return;
                };
                let handlers = self.handlers.lock();
                for handler in handlers.iter() {
                    handler(remote.clone());
                }
            }
            SocketEvent::Error(e) => {
                tracing::warn!(reason = %e.message, "server reported socket error");
            }
            other => {
                tracing::debug!(event = other.name(), "ignoring unexpected inbound event");
            }
        }
    }
}

/// Socket client bound to one conversation.
///
/// Must be used from within a Tokio runtime. Dropping the client
/// disconnects it.
pub struct ChatSocketClient<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> ChatSocketClient<C> {
    /// Create a disconnected client that opens transports with `connector`.
    pub fn new(connector: C, reconnect: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                reconnect,
                state,
                transport: parking_lot::Mutex::new(None),
                handlers: parking_lot::Mutex::new(Vec::new()),
                binding: parking_lot::Mutex::new(None),
                supervisor: parking_lot::Mutex::new(None),
                closed: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Connect and join the room for `(local, peer)`.
    ///
    /// Idempotent: when already `Connected` (or `Reconnecting`) for the same
    /// pair this returns `Ok(())` without opening a second connection or
    /// emitting a second `joinChat`.
    ///
    /// # Errors
    ///
    /// - [`SocketError::AlreadyBound`] if the client was joined for another pair.
    /// - [`SocketError::Closed`] after [`disconnect`](Self::disconnect).
    /// - [`SocketError::Transport`] if the connection or the join fails; the
    ///   client is left `Disconnected`.
    pub async fn connect(&self, local: Participant, peer: UserId) -> Result<(), SocketError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SocketError::Closed);
        }
        let _guard = inner.connect_lock.lock().await;

        {
            let mut binding = inner.binding.lock();
            if let Some(existing) = binding.as_ref() {
                if existing.local.id != local.id || existing.peer != peer {
                    return Err(SocketError::AlreadyBound(existing.conversation_key()));
                }
            } else {
                *binding = Some(Binding { local, peer });
            }
        }

        if matches!(
            *inner.state.borrow(),
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            tracing::debug!("connect called while already connected");
            return Ok(());
        }

        inner.set_state(ConnectionState::Connecting);
        let transport = match inner.connector.connect().await {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                tracing::warn!(err = %e, "socket connect failed");
                inner.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };

        if let Err(e) = inner.send_join(&transport).await {
            transport.close().await;
            inner.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        {
            let mut slot = inner.transport.lock();
            if !inner.is_closed() {
                *slot = Some(Arc::clone(&transport));
                inner.set_state(ConnectionState::Connected);
                let handle =
                    tokio::spawn(supervise(Arc::downgrade(inner), Arc::clone(&transport)));
                if let Some(old) = inner.supervisor.lock().replace(handle) {
                    old.abort();
                }
                return Ok(());
            }
        }
        transport.close().await;
        Err(SocketError::Closed)
    }

    /// Transmit a `sendMessage` event for `message`.
    ///
    /// Returns once the frame is handed to the transport; no server
    /// acknowledgment is awaited. Nothing is buffered while disconnected.
    ///
    /// # Errors
    ///
    /// - [`SocketError::NotConnected`] unless the client is `Connected`.
    /// - [`SocketError::Transport`] if the transport rejects the frame.
    pub async fn send(&self, message: &Message) -> Result<(), SocketError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SocketError::Closed);
        }
        if *inner.state.borrow() != ConnectionState::Connected {
            return Err(SocketError::NotConnected);
        }
        let transport = inner
            .transport
            .lock()
            .clone()
            .ok_or(SocketError::NotConnected)?;
        let peer = inner
            .binding
            .lock()
            .as_ref()
            .map(|b| b.peer.clone())
            .ok_or(SocketError::NotConnected)?;

        let frame = codec::encode(&SocketEvent::SendMessage(OutgoingMessage {
            user_id: message.sender_id.clone(),
            target_user_id: peer,
            first_name: message.sender_first_name.clone(),
            last_name: message.sender_last_name.clone(),
            text: message.text.clone(),
            client_message_id: Some(message.id.clone()),
            created_at: Some(message.created_at),
        }))?;

        transport.send(&frame).await.map_err(|e| {
            tracing::warn!(id = %message.id, err = %e, "socket send failed");
            SocketError::Transport(e)
        })
    }

    /// Register a callback invoked once per inbound message, in arrival
    /// order.
    ///
    /// Callbacks run on the socket's reader task and must not block or call
    /// back into this client.
    pub fn on_message(&self, handler: impl Fn(RemoteMessage) + Send + Sync + 'static) {
        if self.inner.is_closed() {
            return;
        }
        self.inner.handlers.lock().push(Arc::new(handler));
    }

    /// Unregister all handlers and release the connection.
    ///
    /// Synchronous: once this returns, no handler is invoked again. Safe to
    /// call repeatedly. The client cannot be reconnected afterwards.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.handlers.lock().clear();
        // Taken before the supervisor: a connect that saw `closed == false`
        // under this lock has already stored its supervisor.
        let transport = inner.transport.lock().take();
        if let Some(handle) = inner.supervisor.lock().take() {
            handle.abort();
        }
        if let Some(transport) = transport
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(async move { transport.close().await });
        }
        inner.set_state(ConnectionState::Disconnected);
        tracing::info!("socket client disconnected");
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Kind of the live transport, if connected.
    #[must_use]
    pub fn transport_type(&self) -> Option<TransportType> {
        self.inner
            .transport
            .lock()
            .as_ref()
            .map(|t| t.transport_type())
    }

    /// Room the client is bound to, once `connect` has been called.
    #[must_use]
    pub fn conversation_key(&self) -> Option<ConversationKey> {
        self.inner
            .binding
            .lock()
            .as_ref()
            .map(Binding::conversation_key)
    }
}

impl<C: Connector> Drop for ChatSocketClient<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Read frames until the transport drops, then reconnect and repeat.
async fn supervise<C: Connector>(weak: Weak<Inner<C>>, mut transport: Arc<C::Transport>) {
    loop {
        loop {
            match transport.recv().await {
                Ok(frame) => {
                    let Some(inner) = weak.upgrade() else { return };
                    inner.dispatch(&frame);
                }
                Err(e) => {
                    tracing::debug!(err = %e, "socket transport ended");
                    break;
                }
            }
        }

        {
            let Some(inner) = weak.upgrade() else { return };
            if inner.is_closed() {
                return;
            }
            inner.transport.lock().take();
            inner.set_state(ConnectionState::Reconnecting);
            tracing::warn!("socket connection lost, reconnecting");
        }

        match reconnect(&weak).await {
            Some(next) => transport = next,
            None => return,
        }
    }
}

/// Retry with exponential backoff until connected, closed, or out of attempts.
async fn reconnect<C: Connector>(weak: &Weak<Inner<C>>) -> Option<Arc<C::Transport>> {
    let mut attempt = 0u32;
    loop {
        let delay = {
            let inner = weak.upgrade()?;
            if inner.is_closed() {
                return None;
            }
            if let Some(max) = inner.reconnect.max_attempts
                && attempt >= max
            {
                tracing::warn!(attempts = attempt, "giving up on reconnect");
                inner.set_state(ConnectionState::Disconnected);
                return None;
            }
            inner.reconnect.delay_for(attempt)
        };
        tokio::time::sleep(delay).await;
        attempt += 1;

        let inner = weak.upgrade()?;
        if inner.is_closed() {
            return None;
        }
        let transport = match inner.connector.connect().await {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                tracing::warn!(attempt, err = %e, "reconnect attempt failed");
                continue;
            }
        };
        if let Err(e) = inner.send_join(&transport).await {
            tracing::warn!(attempt, err = %e, "re-join failed");
            transport.close().await;
            continue;
        }
        {
            let mut slot = inner.transport.lock();
            if !inner.is_closed() {
                *slot = Some(Arc::clone(&transport));
                inner.set_state(ConnectionState::Connected);
                tracing::info!(attempt, "socket reconnected");
                return Some(transport);
            }
        }
        transport.close().await;
        return None;
    }
}

/// Turn an inbound `messageReceived` payload into a timeline message.
///
/// Sender id comes from `senderId`, then `userId`. Legacy payloads carry
/// neither; the sender is then the local user if the first name matches,
/// otherwise the peer. Payloads without usable text, or from users outside
/// the conversation, are dropped.
#[must_use]
pub fn normalize_incoming(
    payload: ReceivedMessage,
    local: &Participant,
    peer: &UserId,
) -> Option<RemoteMessage> {
    let Some(text) = payload
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
    else {
        tracing::warn!(id = ?payload.id, "dropping message without text");
        return None;
    };

    let sender_id = match payload.sender() {
        Some(id) => id.clone(),
        None => {
            let first = payload.sender_first_name();
            if first.is_some() && first == local.first_name.as_deref() {
                local.id.clone()
            } else {
                peer.clone()
            }
        }
    };
    if &sender_id != peer && sender_id != local.id {
        tracing::warn!(sender = %sender_id, "dropping message from outside the conversation");
        return None;
    }

    let (mut first_name, mut last_name) = (
        payload.sender_first_name().map(str::to_string),
        payload.sender_last_name().map(str::to_string),
    );
    if first_name.is_none() && last_name.is_none() && sender_id == local.id {
        first_name.clone_from(&local.first_name);
        last_name.clone_from(&local.last_name);
    }

    Some(RemoteMessage {
        message: Message {
            id: payload.id.clone().unwrap_or_else(MessageId::generate),
            conversation_key: ConversationKey::for_pair(&local.id, peer),
            sender_id,
            sender_first_name: first_name,
            sender_last_name: last_name,
            text: text.to_string(),
            created_at: payload.created_at.unwrap_or_else(Timestamp::now),
            delivery_state: DeliveryState::Sent,
        },
        echo_of: payload.client_message_id,
    })
}
