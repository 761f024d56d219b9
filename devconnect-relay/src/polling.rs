//! Long-polling sessions.
//!
//! A polling client gets a session id from the handshake and then keeps one
//! `GET` outstanding. Each session owns the receiving half of its
//! connection's outbound channel; the `GET` handler drains it. Sessions no
//! client has touched for a while are swept so their connections leave
//! their rooms.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use devconnect_proto::message::UserId;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::relay::Outbound;
use crate::rooms::ConnId;

/// One long-polling session bound to a relay connection.
pub struct PollSession {
    /// Relay connection backing this session.
    pub conn: ConnId,
    /// Authenticated owner.
    pub user: UserId,
    frames: Mutex<mpsc::UnboundedReceiver<Outbound>>,
    last_seen: Mutex<Instant>,
    closed: AtomicBool,
}

/// What one poll produced.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Frames ready for delivery, in order.
    Frames(Vec<String>),
    /// Nothing arrived before the hold time elapsed.
    Empty,
    /// The session was closed by the relay.
    Closed,
}

impl PollSession {
    fn new(conn: ConnId, user: UserId, frames: mpsc::UnboundedReceiver<Outbound>) -> Self {
        Self {
            conn,
            user,
            frames: Mutex::new(frames),
            last_seen: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether the relay has closed this session.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the session closed. Later polls and sends are refused.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Records client activity.
    pub async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    /// Waits up to `hold` for outbound frames.
    ///
    /// Returns every frame queued at the moment the first one arrives, so a
    /// burst is delivered in one response. A close request ends the session;
    /// frames queued before it are still delivered.
    pub async fn poll(&self, hold: Duration) -> PollOutcome {
        if self.is_closed() {
            return PollOutcome::Closed;
        }
        self.touch().await;
        let mut frames = self.frames.lock().await;
        let first = tokio::time::timeout(hold, frames.recv()).await;
        let outcome = match first {
            Err(_) => PollOutcome::Empty,
            Ok(None | Some(Outbound::Close)) => {
                self.close();
                PollOutcome::Closed
            }
            Ok(Some(Outbound::Frame(frame))) => {
                let mut batch = vec![frame];
                while let Ok(next) = frames.try_recv() {
                    match next {
                        Outbound::Frame(frame) => batch.push(frame),
                        Outbound::Close => {
                            self.close();
                            break;
                        }
                    }
                }
                PollOutcome::Frames(batch)
            }
        };
        drop(frames);
        self.touch().await;
        outcome
    }

    /// Whether no poll is in flight and the client has been silent for
    /// longer than `idle`.
    async fn is_idle(&self, idle: Duration) -> bool {
        if self.frames.try_lock().is_err() {
            return false;
        }
        self.is_closed() || self.last_seen.lock().await.elapsed() > idle
    }
}

/// Registry of active polling sessions keyed by session id.
///
/// Thread-safe via [`RwLock`].
#[derive(Default)]
pub struct PollRegistry {
    sessions: RwLock<HashMap<String, Arc<PollSession>>>,
}

impl PollRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session for `conn` and returns its id.
    pub async fn create(
        &self,
        conn: ConnId,
        user: UserId,
        frames: mpsc::UnboundedReceiver<Outbound>,
    ) -> String {
        let sid = uuid::Uuid::now_v7().to_string();
        let session = Arc::new(PollSession::new(conn, user, frames));
        self.sessions.write().await.insert(sid.clone(), session);
        sid
    }

    /// Looks up a session.
    pub async fn get(&self, sid: &str) -> Option<Arc<PollSession>> {
        self.sessions.read().await.get(sid).cloned()
    }

    /// Removes a session, returning it if it existed.
    pub async fn remove(&self, sid: &str) -> Option<Arc<PollSession>> {
        self.sessions.write().await.remove(sid)
    }

    /// Removes sessions that are closed or idle for longer than `idle` and
    /// returns them.
    pub async fn sweep(&self, idle: Duration) -> Vec<Arc<PollSession>> {
        let candidates: Vec<(String, Arc<PollSession>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(sid, s)| (sid.clone(), Arc::clone(s)))
            .collect();

        let mut expired = Vec::new();
        for (sid, session) in candidates {
            if session.is_idle(idle).await {
                expired.push(sid);
            }
        }
        if expired.is_empty() {
            return Vec::new();
        }

        let mut sessions = self.sessions.write().await;
        let removed = expired
            .iter()
            .filter_map(|sid| sessions.remove(sid))
            .collect();
        drop(sessions);
        removed
    }

    /// Number of open sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no sessions are open.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
