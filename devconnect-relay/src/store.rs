//! In-memory conversation store.
//!
//! The [`ConversationStore`] keeps a bounded history per conversation, the
//! profile names users announced over the socket, and the data the inbox
//! endpoint summarizes. When a conversation's history exceeds the cap, the
//! oldest message is dropped.

use std::collections::{HashMap, VecDeque};

use devconnect_proto::event::UserProfile;
use devconnect_proto::history::{ChatSummary, LastMessage};
use devconnect_proto::message::{ConversationKey, MessageId, Timestamp, UserId};
use tokio::sync::RwLock;

/// Default number of messages kept per conversation.
const DEFAULT_MAX_HISTORY: usize = 1000;

/// A message persisted by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Server-assigned id.
    pub id: MessageId,
    /// Sender.
    pub sender: UserId,
    /// Message body (trimmed).
    pub text: String,
    /// Server receive time.
    pub created_at: Timestamp,
}

struct Conversation {
    participants: [UserId; 2],
    messages: VecDeque<StoredMessage>,
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<ConversationKey, Conversation>,
    profiles: HashMap<UserId, UserProfile>,
}

/// Per-conversation message history with FIFO eviction.
///
/// Thread-safe via [`RwLock`].
pub struct ConversationStore {
    inner: RwLock<Inner>,
    max_history: usize,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// Creates an empty store with the default history cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    /// Creates an empty store keeping at most `max_history` messages per
    /// conversation.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_history: max_history.max(1),
        }
    }

    /// Stores a message from `from` to `to` and returns it with its server
    /// id and timestamp.
    ///
    /// Timestamps are strictly increasing within a conversation, so two
    /// messages stored in the same millisecond keep their order.
    pub async fn append(&self, from: &UserId, to: &UserId, text: &str) -> StoredMessage {
        let key = ConversationKey::for_pair(from, to);
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .entry(key)
            .or_insert_with(|| Conversation {
                participants: [from.clone(), to.clone()],
                messages: VecDeque::new(),
            });

        let mut created_at = Timestamp::now();
        if let Some(last) = conversation.messages.back()
            && created_at <= last.created_at
        {
            created_at = Timestamp::from_millis(last.created_at.as_millis() + 1);
        }
        let message = StoredMessage {
            id: MessageId::generate(),
            sender: from.clone(),
            text: text.to_string(),
            created_at,
        };
        conversation.messages.push_back(message.clone());
        if conversation.messages.len() > self.max_history {
            conversation.messages.pop_front();
        }
        drop(inner);
        message
    }

    /// Returns the stored history between `a` and `b`, oldest first.
    pub async fn history(&self, a: &UserId, b: &UserId) -> Vec<StoredMessage> {
        let key = ConversationKey::for_pair(a, b);
        let inner = self.inner.read().await;
        inner
            .conversations
            .get(&key)
            .map(|c| c.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records the names a user announced. Missing names do not erase
    /// known ones.
    pub async fn remember_profile(
        &self,
        id: &UserId,
        first_name: Option<String>,
        last_name: Option<String>,
    ) {
        let mut inner = self.inner.write().await;
        let profile = inner
            .profiles
            .entry(id.clone())
            .or_insert_with(|| UserProfile {
                id: id.clone(),
                first_name: None,
                last_name: None,
            });
        if first_name.is_some() {
            profile.first_name = first_name;
        }
        if last_name.is_some() {
            profile.last_name = last_name;
        }
    }

    /// Returns the profile for `id`, with empty names if none were announced.
    pub async fn profile(&self, id: &UserId) -> UserProfile {
        let inner = self.inner.read().await;
        inner.profiles.get(id).cloned().unwrap_or_else(|| UserProfile {
            id: id.clone(),
            first_name: None,
            last_name: None,
        })
    }

    /// Returns one inbox summary per conversation `user` takes part in.
    pub async fn conversations_for(&self, user: &UserId) -> Vec<ChatSummary> {
        let inner = self.inner.read().await;
        inner
            .conversations
            .values()
            .filter(|c| c.participants.contains(user))
            .map(|c| {
                let other = if &c.participants[0] == user {
                    &c.participants[1]
                } else {
                    &c.participants[0]
                };
                let profile = |id: &UserId| {
                    inner.profiles.get(id).cloned().unwrap_or_else(|| UserProfile {
                        id: id.clone(),
                        first_name: None,
                        last_name: None,
                    })
                };
                let last_message = c.messages.back().map(|m| LastMessage {
                    text: m.text.clone(),
                    sender_id: Some(m.sender.clone()),
                    sender_name: profile(&m.sender).first_name,
                    timestamp: Some(m.created_at),
                });
                ChatSummary {
                    other_user: Some(profile(other)),
                    updated_at: c.messages.back().map(|m| m.created_at),
                    last_message,
                }
            })
            .collect()
    }
}
