//! Chat application layer for `DevConnect`.
//!
//! Contains the [`ChatSession`] facade, which binds a history loader, a
//! socket client and a reconciler together for one conversation: history
//! and the socket connect run concurrently, remote messages that arrive
//! before history are held back and applied after it, and local sends go
//! through the optimistic echo flow
//! (validate -> append as pending -> transmit -> confirm or fail).

pub mod history;
pub mod message;
pub mod reconciler;
pub mod socket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use devconnect_proto::message::{
    ConversationKey, MessageId, Timestamp, UserId, ValidationError, validate_text,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::transport::Connector;

use history::{HistoryError, HistoryLoader};
use message::{DeliveryState, Message, Participant};
use reconciler::{DEFAULT_ECHO_TOLERANCE, MessageReconciler, RemoteMessage, RemoteOutcome};
use socket::{ChatSocketClient, ConnectionState, ReconnectConfig, SocketError};

/// Errors returned by [`ChatSession::send_message`] and
/// [`ChatSession::retry_failed`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The session has been closed.
    #[error("session is closed")]
    Closed,

    /// History has not been loaded yet.
    #[error("session is not ready")]
    NotReady,

    /// The text was rejected before sending.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The message to retry is not in the `Failed` state.
    #[error("message {0} is not a failed message")]
    NotFailed(MessageId),
}

/// Errors returned by [`ChatSession::reload_history`].
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    /// The session has been closed.
    #[error("session is closed")]
    Closed,

    /// The history request failed.
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Tuning for a [`ChatSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Window for matching a server echo to a local message by content.
    pub echo_tolerance: Duration,
    /// How long a transmitted message may stay pending before it is marked
    /// failed.
    pub ack_timeout: Duration,
    /// Treat a successful transmit as confirmation instead of waiting for
    /// the echo.
    pub confirm_on_transmit: bool,
    /// Maximum message length in characters, if any.
    pub max_message_len: Option<usize>,
    /// Capacity of the session event channel.
    pub event_buffer: usize,
    /// Socket reconnect policy.
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            echo_tolerance: DEFAULT_ECHO_TOLERANCE,
            ack_timeout: Duration::from_secs(10),
            confirm_on_transmit: false,
            max_message_len: None,
            event_buffer: 256,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Why a session could not become ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    /// History failed to load.
    History(String),
    /// The first socket connection failed.
    Connect(String),
}

/// Lifecycle of a [`ChatSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// History is still loading.
    Initializing,
    /// History is loaded; the socket is in the given state.
    Ready(ConnectionState),
    /// History load or the first connect failed.
    Failed(SessionFailure),
    /// The session has been closed.
    Closed,
}

/// Notifications for the view bound to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The timeline changed; re-read it.
    TimelineUpdated,
    /// The socket changed state.
    ConnectionChanged(ConnectionState),
    /// History loaded with `count` messages.
    HistoryLoaded {
        /// Number of history messages.
        count: usize,
    },
    /// History failed to load.
    HistoryFailed {
        /// Failure description.
        reason: String,
    },
    /// The first socket connection failed.
    ConnectFailed {
        /// Failure description.
        reason: String,
    },
    /// A local message changed delivery state.
    DeliveryChanged {
        /// Message id.
        id: MessageId,
        /// New state.
        state: DeliveryState,
    },
    /// The server's copy of a local message arrived and replaced its id.
    MessageConfirmed {
        /// Id returned by `send_message`.
        local_id: MessageId,
        /// Server id the message now carries.
        id: MessageId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HistoryStatus {
    Loading,
    Loaded,
    Failed(String),
}

#[derive(Debug)]
struct Status {
    history: HistoryStatus,
    connect_failure: Option<String>,
}

/// State shared between the session and its background tasks.
struct Shared<H> {
    config: SessionConfig,
    local: Participant,
    peer: UserId,
    key: ConversationKey,
    history: H,
    reconciler: MessageReconciler,
    status: parking_lot::Mutex<Status>,
    /// Remote messages held until history is seeded; `None` once seeded.
    backlog: parking_lot::Mutex<Option<Vec<RemoteMessage>>>,
    events: mpsc::Sender<SessionEvent>,
    closed: AtomicBool,
}

impl<H: HistoryLoader> Shared<H> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!(err = %e, "session event dropped");
        }
    }

    fn on_remote(&self, remote: RemoteMessage) {
        if self.is_closed() {
            return;
        }
        let mut backlog = self.backlog.lock();
        match backlog.as_mut() {
            Some(held) => {
                tracing::debug!(id = %remote.message.id, "holding remote message until history loads");
                held.push(remote);
            }
            None => self.apply_remote(remote),
        }
    }

    fn apply_remote(&self, remote: RemoteMessage) {
        match self.reconciler.append_remote(remote) {
            RemoteOutcome::Inserted(_) => self.emit(SessionEvent::TimelineUpdated),
            RemoteOutcome::Promoted { local_id, id } => {
                self.emit(SessionEvent::MessageConfirmed { local_id, id });
                self.emit(SessionEvent::TimelineUpdated);
            }
            RemoteOutcome::Duplicate => {}
        }
    }

    /// Seed (or re-seed) the timeline and drain the backlog.
    fn install_history(&self, messages: Vec<Message>) -> usize {
        let count = messages.len();
        let mut backlog = self.backlog.lock();
        match backlog.take() {
            Some(held) => {
                self.reconciler.seed(messages);
                for remote in held {
                    self.apply_remote(remote);
                }
            }
            None => {
                for (local_id, id) in self.reconciler.reseed(messages) {
                    self.emit(SessionEvent::MessageConfirmed { local_id, id });
                }
            }
        }
        drop(backlog);
        self.status.lock().history = HistoryStatus::Loaded;
        count
    }

    fn finish_history_load(
        &self,
        result: Result<Vec<Message>, HistoryError>,
    ) -> Result<usize, HistoryError> {
        match result {
            Ok(messages) => {
                let count = self.install_history(messages);
                tracing::info!(room = %self.key, count, "history loaded");
                self.emit(SessionEvent::HistoryLoaded { count });
                self.emit(SessionEvent::TimelineUpdated);
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(room = %self.key, err = %e, "history load failed");
                {
                    let mut status = self.status.lock();
                    if status.history != HistoryStatus::Loaded {
                        status.history = HistoryStatus::Failed(e.to_string());
                    }
                }
                self.emit(SessionEvent::HistoryFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn fail_message(&self, id: &MessageId) {
        if self.reconciler.mark_failed(id) {
            self.emit(SessionEvent::DeliveryChanged {
                id: id.clone(),
                state: DeliveryState::Failed,
            });
            self.emit(SessionEvent::TimelineUpdated);
        }
    }
}

/// One open conversation between the local user and a peer.
///
/// Must be created inside a Tokio runtime. Dropping the session closes it.
pub struct ChatSession<H: HistoryLoader, C: Connector> {
    shared: Arc<Shared<H>>,
    socket: Arc<ChatSocketClient<C>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<H: HistoryLoader, C: Connector> ChatSession<H, C> {
    /// Open a session for `(local, peer)`.
    ///
    /// History load and socket connect start immediately and run
    /// concurrently. Progress is reported on the returned event receiver.
    pub fn open(
        config: SessionConfig,
        local: Participant,
        peer: UserId,
        history: H,
        connector: C,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let socket = Arc::new(ChatSocketClient::new(connector, config.reconnect.clone()));
        let key = ConversationKey::for_pair(&local.id, &peer);
        let shared = Arc::new(Shared {
            reconciler: MessageReconciler::with_echo_tolerance(config.echo_tolerance),
            config,
            local,
            peer,
            key,
            history,
            status: parking_lot::Mutex::new(Status {
                history: HistoryStatus::Loading,
                connect_failure: None,
            }),
            backlog: parking_lot::Mutex::new(Some(Vec::new())),
            events,
            closed: AtomicBool::new(false),
        });
        tracing::info!(room = %shared.key, "opening chat session");

        let weak = Arc::downgrade(&shared);
        socket.on_message(move |remote| {
            if let Some(shared) = weak.upgrade() {
                shared.on_remote(remote);
            }
        });

        let history_task = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let result = shared
                    .history
                    .load_history(&shared.local, &shared.peer)
                    .await;
                let _ = shared.finish_history_load(result);
            })
        };
        let connect_task = tokio::spawn(connect_socket(Arc::clone(&shared), Arc::clone(&socket)));
        let state_task = tokio::spawn(forward_connection_state(
            Arc::downgrade(&shared),
            socket.subscribe(),
        ));

        let session = Self {
            shared,
            socket,
            tasks: parking_lot::Mutex::new(vec![history_task, connect_task, state_task]),
        };
        (session, events_rx)
    }

    /// Send `text` as a new message.
    ///
    /// The message is added to the timeline as `Pending` before anything is
    /// transmitted. If the socket rejects it, it stays visible as `Failed`;
    /// the returned id identifies it either way.
    ///
    /// # Errors
    ///
    /// - [`SendError::Closed`] after [`close`](Self::close).
    /// - [`SendError::NotReady`] before history has loaded.
    /// - [`SendError::Validation`] for blank or over-long text; the timeline
    ///   is unchanged.
    pub async fn send_message(&self, text: &str) -> Result<MessageId, SendError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(SendError::Closed);
        }
        if shared.status.lock().history != HistoryStatus::Loaded {
            return Err(SendError::NotReady);
        }
        let text = validate_text(text, shared.config.max_message_len)?;

        let message = Message {
            id: MessageId::generate(),
            conversation_key: shared.key.clone(),
            sender_id: shared.local.id.clone(),
            sender_first_name: shared.local.first_name.clone(),
            sender_last_name: shared.local.last_name.clone(),
            text: text.to_string(),
            created_at: Timestamp::now(),
            delivery_state: DeliveryState::Pending,
        };
        let id = shared.reconciler.append_local(message.clone());
        shared.emit(SessionEvent::TimelineUpdated);

        match self.socket.send(&message).await {
            Ok(()) if shared.config.confirm_on_transmit => {
                if shared.reconciler.mark_sent(&id) {
                    shared.emit(SessionEvent::DeliveryChanged {
                        id: id.clone(),
                        state: DeliveryState::Sent,
                    });
                    shared.emit(SessionEvent::TimelineUpdated);
                }
            }
            Ok(()) => self.arm_ack_timer(id.clone()),
            Err(SocketError::Closed) if shared.is_closed() => return Err(SendError::Closed),
            Err(e) => {
                tracing::warn!(id = %id, err = %e, "message not transmitted");
                shared.fail_message(&id);
            }
        }
        Ok(id)
    }

    /// Remove a failed message and send its text again.
    ///
    /// Returns the id of the new message.
    ///
    /// # Errors
    ///
    /// [`SendError::NotFailed`] if `id` is not a failed message, otherwise
    /// the errors of [`send_message`](Self::send_message).
    pub async fn retry_failed(&self, id: &MessageId) -> Result<MessageId, SendError> {
        if self.shared.is_closed() {
            return Err(SendError::Closed);
        }
        let failed = self
            .shared
            .reconciler
            .discard(id)
            .ok_or_else(|| SendError::NotFailed(id.clone()))?;
        tracing::debug!(id = %id, "retrying failed message");
        self.shared.emit(SessionEvent::TimelineUpdated);
        self.send_message(&failed.text).await
    }

    /// Fetch history again and re-seed the timeline.
    ///
    /// Local messages that are still unconfirmed stay in the timeline.
    /// Returns the number of history messages loaded.
    ///
    /// # Errors
    ///
    /// [`ReloadError::History`] if the fetch fails; a timeline that was
    /// already loaded is kept.
    pub async fn reload_history(&self) -> Result<usize, ReloadError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(ReloadError::Closed);
        }
        let result = shared
            .history
            .load_history(&shared.local, &shared.peer)
            .await;
        if shared.is_closed() {
            return Err(ReloadError::Closed);
        }
        Ok(shared.finish_history_load(result)?)
    }

    /// Retry the socket connection after the first attempt failed.
    ///
    /// Does nothing while the socket is connected or reconnecting.
    pub fn reconnect(&self) {
        if self.shared.is_closed() {
            return;
        }
        let task = tokio::spawn(connect_socket(
            Arc::clone(&self.shared),
            Arc::clone(&self.socket),
        ));
        self.track(task);
    }

    /// Ordered snapshot of the timeline. Empty after close.
    #[must_use]
    pub fn timeline(&self) -> Vec<Message> {
        self.shared.reconciler.timeline()
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.shared.is_closed() {
            return SessionState::Closed;
        }
        let status = self.shared.status.lock();
        match (&status.history, &status.connect_failure) {
            (HistoryStatus::Failed(reason), _) => {
                SessionState::Failed(SessionFailure::History(reason.clone()))
            }
            (_, Some(reason)) => SessionState::Failed(SessionFailure::Connect(reason.clone())),
            (HistoryStatus::Loading, None) => SessionState::Initializing,
            (HistoryStatus::Loaded, None) => SessionState::Ready(self.socket.state()),
        }
    }

    /// Current socket state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.socket.state()
    }

    /// Room this session is bound to.
    #[must_use]
    pub fn conversation_key(&self) -> &ConversationKey {
        &self.shared.key
    }

    /// The local participant.
    #[must_use]
    pub fn local(&self) -> &Participant {
        &self.shared.local
    }

    /// The peer's user id.
    #[must_use]
    pub fn peer(&self) -> &UserId {
        &self.shared.peer
    }

    /// Close the session.
    ///
    /// Socket handlers are unregistered before this returns, so no late
    /// message reaches the timeline. Background tasks are aborted and the
    /// timeline is released. Calling it again does nothing.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.socket.disconnect();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.backlog.lock().take();
        self.shared.reconciler.seed(Vec::new());
        tracing::info!(room = %self.shared.key, "chat session closed");
    }

    fn arm_ack_timer(&self, id: MessageId) {
        let weak = Arc::downgrade(&self.shared);
        let timeout = self.shared.config.ack_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = weak.upgrade() else { return };
            if shared.is_closed() {
                return;
            }
            if shared.reconciler.get(&id).map(|m| m.delivery_state) == Some(DeliveryState::Pending)
            {
                tracing::warn!(id = %id, "no echo within ack timeout");
                shared.fail_message(&id);
            }
        });
        self.track(task);
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        if self.shared.is_closed() {
            task.abort();
        } else {
            tasks.push(task);
        }
    }
}

impl<H: HistoryLoader, C: Connector> Drop for ChatSession<H, C> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn connect_socket<H: HistoryLoader, C: Connector>(
    shared: Arc<Shared<H>>,
    socket: Arc<ChatSocketClient<C>>,
) {
    match socket
        .connect(shared.local.clone(), shared.peer.clone())
        .await
    {
        Ok(()) => {
            shared.status.lock().connect_failure = None;
        }
        Err(SocketError::Closed) => {}
        Err(e) => {
            tracing::warn!(room = %shared.key, err = %e, "chat socket connect failed");
            shared.status.lock().connect_failure = Some(e.to_string());
            shared.emit(SessionEvent::ConnectFailed {
                reason: e.to_string(),
            });
        }
    }
}

async fn forward_connection_state<H: HistoryLoader>(
    weak: Weak<Shared<H>>,
    mut states: watch::Receiver<ConnectionState>,
) {
    while states.changed().await.is_ok() {
        let state = *states.borrow_and_update();
        let Some(shared) = weak.upgrade() else { return };
        if shared.is_closed() {
            return;
        }
        if state == ConnectionState::Connected {
            shared.status.lock().connect_failure = None;
        }
        shared.emit(SessionEvent::ConnectionChanged(state));
    }
}
