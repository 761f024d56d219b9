//! REST payloads for chat history and the conversation inbox.

use serde::{Deserialize, Serialize};

use crate::event::{SenderRef, UserProfile, lenient_timestamp};
use crate::message::{MessageId, Timestamp, UserId};

/// Response body of `GET /chat/{peerUserId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistoryResponse {
    /// Whether the backend accepted the request.
    #[serde(default = "default_success")]
    pub success: bool,
    /// Profile of the other participant, when the backend includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_user: Option<UserProfile>,
    /// Stored messages, in whatever order the backend returns them.
    #[serde(default)]
    pub messages: Vec<HistoryEntry>,
    /// Failure reason when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One stored message as returned by the history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Server id.
    #[serde(
        default,
        rename = "_id",
        alias = "id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<MessageId>,
    /// Sender, as a bare id or a populated profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<SenderRef>,
    /// Message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Server timestamp.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub created_at: Option<Timestamp>,
}

/// Response body of `GET /chats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatListResponse {
    /// Whether the backend accepted the request.
    #[serde(default = "default_success")]
    pub success: bool,
    /// One entry per conversation the user takes part in.
    #[serde(default)]
    pub chats: Vec<ChatSummary>,
}

/// Inbox entry for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    /// The other participant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_user: Option<UserProfile>,
    /// Most recent message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    /// Last time the conversation changed.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub updated_at: Option<Timestamp>,
}

impl ChatSummary {
    /// Time used to order the inbox: the last message, else the
    /// conversation's update time.
    #[must_use]
    pub fn activity_at(&self) -> Option<Timestamp> {
        self.last_message
            .as_ref()
            .and_then(|m| m.timestamp)
            .or(self.updated_at)
    }
}

/// Preview of the most recent message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    /// Message body.
    #[serde(default)]
    pub text: String,
    /// Sender id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    /// Sender display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// When the message was sent.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub timestamp: Option<Timestamp>,
}

const fn default_success() -> bool {
    true
}
