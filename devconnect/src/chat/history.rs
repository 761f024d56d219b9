//! Chat history loading.
//!
//! Defines the [`HistoryLoader`] trait used by the session to fetch prior
//! messages, the REST-backed [`HttpHistoryLoader`], and [`StaticHistory`],
//! an in-memory loader for tests.
//!
//! The backend returns senders either as bare ids or as populated profile
//! objects. [`normalize_history`] flattens both into [`Message`]s, drops
//! entries that cannot be displayed (no text, no sender, no timestamp) with
//! a logged warning, and sorts the result by `created_at`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use devconnect_proto::event::{SenderRef, UserProfile};
use devconnect_proto::history::{ChatHistoryResponse, ChatListResponse, ChatSummary};
use devconnect_proto::message::{ConversationKey, MessageId, UserId};
use tokio::sync::Notify;

use super::message::{DeliveryState, Message, Participant};

/// Default timeout for one history request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors that can occur while loading history.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The request could not be completed.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("history request failed with status {0}")]
    Status(u16),

    /// The backend answered `success: false`.
    #[error("history request rejected: {0}")]
    Rejected(String),

    /// The configured base URL cannot address the history endpoint.
    #[error("invalid history URL: {0}")]
    InvalidUrl(String),
}

/// Fetches the stored messages of a conversation.
pub trait HistoryLoader: Send + Sync + 'static {
    /// Load the history between `local` and `peer`, sorted by `created_at`.
    ///
    /// No retry is attempted; failures are reported to the caller.
    fn load_history(
        &self,
        local: &Participant,
        peer: &UserId,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, HistoryError>> + Send;
}

/// Flatten a history response into timeline messages.
///
/// Names come from a populated sender profile when present; bare ids are
/// resolved against `local` and the response's `otherUser`. Unresolvable
/// names are left empty. Entries without a server id get a generated one.
#[must_use]
pub fn normalize_history(
    response: ChatHistoryResponse,
    local: &Participant,
    peer: &UserId,
) -> Vec<Message> {
    let conversation_key = ConversationKey::for_pair(&local.id, peer);
    let other_user = response.other_user;
    let mut messages = Vec::with_capacity(response.messages.len());

    for entry in response.messages {
        let Some(text) = entry.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
            tracing::warn!(id = ?entry.id, "history entry without text, skipping");
            continue;
        };
        let Some(sender) = entry.sender_id else {
            tracing::warn!(id = ?entry.id, "history entry without sender, skipping");
            continue;
        };
        let Some(created_at) = entry.created_at else {
            tracing::warn!(id = ?entry.id, "history entry without timestamp, skipping");
            continue;
        };

        if sender.id() != &local.id && sender.id() != peer {
            tracing::warn!(
                id = ?entry.id,
                sender = %sender.id(),
                "history entry from outside the conversation, skipping"
            );
            continue;
        }

        let (first_name, last_name) = resolve_names(&sender, local, other_user.as_ref());
        messages.push(Message {
            id: entry.id.unwrap_or_else(MessageId::generate),
            conversation_key: conversation_key.clone(),
            sender_id: sender.id().clone(),
            sender_first_name: first_name,
            sender_last_name: last_name,
            text: text.to_string(),
            created_at,
            delivery_state: DeliveryState::Sent,
        });
    }

    messages.sort_by_key(|m| m.created_at);
    messages
}

fn resolve_names(
    sender: &SenderRef,
    local: &Participant,
    other_user: Option<&UserProfile>,
) -> (Option<String>, Option<String>) {
    if let SenderRef::Profile(profile) = sender {
        return (profile.first_name.clone(), profile.last_name.clone());
    }
    let id = sender.id();
    if id == &local.id {
        return (local.first_name.clone(), local.last_name.clone());
    }
    match other_user {
        Some(other) if &other.id == id => (other.first_name.clone(), other.last_name.clone()),
        _ => (None, None),
    }
}

/// Loads history from the `DevConnect` REST API.
///
/// Authenticates with the `token` cookie, the same credential the browser
/// client sends.
#[derive(Debug, Clone)]
pub struct HttpHistoryLoader {
    base_url: url::Url,
    auth_token: Option<String>,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpHistoryLoader {
    /// Create a loader for the API at `base_url` (e.g. `http://localhost:7000`).
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidUrl`] if `base_url` is not an absolute
    /// URL that can carry a path.
    pub fn new(base_url: &str) -> Result<Self, HistoryError> {
        let base_url =
            url::Url::parse(base_url).map_err(|e| HistoryError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(HistoryError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            base_url,
            auth_token: None,
            client: reqwest::Client::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Send `token` as the `token` cookie.
    #[must_use]
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// Override the per-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Fetch the inbox: one summary per conversation, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] on transport failure, a non-2xx status, an
    /// undecodable body, or `success: false`.
    pub async fn list_conversations(&self) -> Result<Vec<ChatSummary>, HistoryError> {
        let url = self.endpoint(&["chats"])?;
        let response: ChatListResponse = self.get_json(url).await?;
        if !response.success {
            return Err(HistoryError::Rejected("inbox request rejected".to_string()));
        }
        let mut chats = response.chats;
        chats.sort_by_key(|c| std::cmp::Reverse(c.activity_at()));
        Ok(chats)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<url::Url, HistoryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| HistoryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: url::Url,
    ) -> Result<T, HistoryError> {
        let mut request = self.client.get(url.clone()).timeout(self.request_timeout);
        if let Some(token) = &self.auth_token {
            request = request.header(reqwest::header::COOKIE, format!("token={token}"));
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(url = %url, status = %status, "history request failed");
            return Err(HistoryError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}

impl HistoryLoader for HttpHistoryLoader {
    async fn load_history(
        &self,
        local: &Participant,
        peer: &UserId,
    ) -> Result<Vec<Message>, HistoryError> {
        let url = self.endpoint(&["chat", peer.as_str()])?;
        let response: ChatHistoryResponse = self.get_json(url).await?;
        if !response.success {
            let reason = response
                .message
                .clone()
                .unwrap_or_else(|| "history request rejected".to_string());
            return Err(HistoryError::Rejected(reason));
        }
        let messages = normalize_history(response, local, peer);
        tracing::info!(peer = %peer, count = messages.len(), "history loaded");
        Ok(messages)
    }
}

/// In-memory [`HistoryLoader`] for tests.
///
/// Clones share state, so a test can keep a handle and change what later
/// loads return. An optional gate holds every load until released.
#[derive(Clone, Default)]
pub struct StaticHistory {
    inner: Arc<StaticInner>,
}

#[derive(Default)]
struct StaticInner {
    messages: parking_lot::Mutex<Vec<Message>>,
    failure: parking_lot::Mutex<Option<String>>,
    calls: AtomicUsize,
    gate: parking_lot::Mutex<Option<Arc<Notify>>>,
}

impl StaticHistory {
    /// A loader that returns `messages`.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        let history = Self::default();
        history.set_messages(messages);
        history
    }

    /// A loader that fails with `reason`.
    #[must_use]
    pub fn failing(reason: &str) -> Self {
        let history = Self::default();
        history.set_failure(Some(reason));
        history
    }

    /// Replace the messages later loads return.
    pub fn set_messages(&self, messages: Vec<Message>) {
        *self.inner.messages.lock() = messages;
    }

    /// Make later loads fail (`Some`) or succeed (`None`).
    pub fn set_failure(&self, reason: Option<&str>) {
        *self.inner.failure.lock() = reason.map(str::to_string);
    }

    /// Hold every load until [`StaticHistory::release`] is called once per load.
    pub fn hold(&self) {
        *self.inner.gate.lock() = Some(Arc::new(Notify::new()));
    }

    /// Let one held load proceed.
    pub fn release(&self) {
        if let Some(gate) = self.inner.gate.lock().as_ref() {
            gate.notify_one();
        }
    }

    /// Number of loads started so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

impl HistoryLoader for StaticHistory {
    async fn load_history(
        &self,
        _local: &Participant,
        _peer: &UserId,
    ) -> Result<Vec<Message>, HistoryError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.inner.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(reason) = self.inner.failure.lock().clone() {
            return Err(HistoryError::Rejected(reason));
        }
        let mut messages = self.inner.messages.lock().clone();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devconnect_proto::history::HistoryEntry;
    use devconnect_proto::message::Timestamp;

    fn alice() -> Participant {
        Participant::new("alice").with_name(Some("Alice".into()), Some("A".into()))
    }

    fn entry(id: Option<&str>, sender: Option<SenderRef>, text: Option<&str>, at: Option<u64>) -> HistoryEntry {
        HistoryEntry {
            id: id.map(MessageId::new),
            sender_id: sender,
            text: text.map(str::to_string),
            created_at: at.map(Timestamp::from_millis),
        }
    }

    fn bare(id: &str) -> Option<SenderRef> {
        Some(SenderRef::Id(UserId::new(id)))
    }

    fn response(messages: Vec<HistoryEntry>, other: Option<UserProfile>) -> ChatHistoryResponse {
        ChatHistoryResponse {
            success: true,
            other_user: other,
            messages,
            message: None,
        }
    }

    #[test]
    fn normalizes_both_sender_shapes() {
        let profile = SenderRef::Profile(UserProfile {
            id: UserId::new("bob"),
            first_name: Some("Bob".into()),
            last_name: Some("B".into()),
        });
        let resp = response(
            vec![
                entry(Some("m1"), Some(profile), Some("hi"), Some(100)),
                entry(Some("m2"), bare("alice"), Some("hello"), Some(200)),
            ],
            None,
        );
        let messages = normalize_history(resp, &alice(), &UserId::new("bob"));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender_id, UserId::new("bob"));
        assert_eq!(messages[0].sender_first_name.as_deref(), Some("Bob"));
        assert_eq!(messages[1].sender_first_name.as_deref(), Some("Alice"));
        assert!(messages.iter().all(|m| m.delivery_state == DeliveryState::Sent));
        assert_eq!(
            messages[0].conversation_key,
            ConversationKey::for_pair(&UserId::new("alice"), &UserId::new("bob"))
        );
    }

    #[test]
    fn bare_peer_id_resolves_through_other_user() {
        let other = UserProfile {
            id: UserId::new("bob"),
            first_name: Some("Bob".into()),
            last_name: None,
        };
        let resp = response(vec![entry(Some("m1"), bare("bob"), Some("x"), Some(1))], Some(other));
        let messages = normalize_history(resp, &alice(), &UserId::new("bob"));
        assert_eq!(messages[0].sender_first_name.as_deref(), Some("Bob"));
    }

    #[test]
    fn unresolved_peer_has_no_names() {
        let resp = response(vec![entry(Some("m1"), bare("bob"), Some("x"), Some(1))], None);
        let messages = normalize_history(resp, &alice(), &UserId::new("bob"));
        assert!(messages[0].sender_first_name.is_none());
        assert_eq!(messages[0].sender_display_name(), "Unknown");
    }

    #[test]
    fn senders_outside_the_pair_are_skipped() {
        let resp = response(
            vec![
                entry(Some("m1"), bare("bob"), Some("mine"), Some(1)),
                entry(Some("m2"), bare("carol"), Some("not for you"), Some(2)),
                entry(Some("m3"), bare("alice"), Some("reply"), Some(3)),
            ],
            None,
        );
        let messages = normalize_history(resp, &alice(), &UserId::new("bob"));
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m3"]);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let resp = response(
            vec![
                entry(Some("ok"), bare("bob"), Some("fine"), Some(10)),
                entry(Some("no-text"), bare("bob"), None, Some(20)),
                entry(Some("blank"), bare("bob"), Some("   "), Some(20)),
                entry(Some("no-sender"), None, Some("x"), Some(30)),
                entry(Some("no-time"), bare("bob"), Some("x"), None),
            ],
            None,
        );
        let messages = normalize_history(resp, &alice(), &UserId::new("bob"));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, MessageId::new("ok"));
    }

    #[test]
    fn sorts_by_time_and_generates_missing_ids() {
        let resp = response(
            vec![
                entry(Some("late"), bare("bob"), Some("b"), Some(500)),
                entry(None, bare("alice"), Some("a"), Some(100)),
            ],
            None,
        );
        let messages = normalize_history(resp, &alice(), &UserId::new("bob"));
        assert_eq!(messages[1].id, MessageId::new("late"));
        assert!(!messages[0].id.is_empty());
    }

    #[test]
    fn endpoint_appends_segments() {
        let loader = HttpHistoryLoader::new("http://localhost:7000/").unwrap();
        let url = loader.endpoint(&["chat", "abc"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:7000/chat/abc");

        let nested = HttpHistoryLoader::new("https://api.example.com/v2").unwrap();
        assert_eq!(
            nested.endpoint(&["chats"]).unwrap().as_str(),
            "https://api.example.com/v2/chats"
        );
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(matches!(
            HttpHistoryLoader::new("mailto:someone@example.com"),
            Err(HistoryError::InvalidUrl(_))
        ));
        assert!(HttpHistoryLoader::new("not a url").is_err());
    }

    #[tokio::test]
    async fn static_history_can_fail_and_recover() {
        let history = StaticHistory::failing("offline");
        let peer = UserId::new("bob");
        assert!(history.load_history(&alice(), &peer).await.is_err());
        history.set_failure(None);
        assert!(history.load_history(&alice(), &peer).await.unwrap().is_empty());
        assert_eq!(history.calls(), 2);
    }

    #[tokio::test]
    async fn http_loader_reads_relay_history() {
        let (addr, _handle) = devconnect_relay::relay::start_server("127.0.0.1:0")
            .await
            .unwrap();
        let loader = HttpHistoryLoader::new(&format!("http://{addr}"))
            .unwrap()
            .with_auth_token(Some("alice".into()));
        let messages = loader
            .load_history(&alice(), &UserId::new("bob"))
            .await
            .unwrap();
        assert!(messages.is_empty());
        assert!(loader.list_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn http_loader_surfaces_auth_failure() {
        let (addr, _handle) = devconnect_relay::relay::start_server("127.0.0.1:0")
            .await
            .unwrap();
        let loader = HttpHistoryLoader::new(&format!("http://{addr}")).unwrap();
        let result = loader.load_history(&alice(), &UserId::new("bob")).await;
        assert!(matches!(result, Err(HistoryError::Status(401))));
    }

    #[tokio::test]
    async fn http_loader_surfaces_connection_failure() {
        let loader = HttpHistoryLoader::new("http://127.0.0.1:1").unwrap();
        let result = loader.load_history(&alice(), &UserId::new("bob")).await;
        assert!(matches!(result, Err(HistoryError::Network(_))));
    }
}
