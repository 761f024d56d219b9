//! Socket event vocabulary.
//!
//! Every frame on the bidirectional channel is a JSON object of the form
//! `{"event": <name>, "data": <payload>}`. Outbound events (`joinChat`,
//! `sendMessage`) have a fixed shape. Inbound `messageReceived` payloads are
//! accepted in both shapes the backend has emitted over time:
//!
//! - legacy: `{firstName, lastName, text}`
//! - rich: `{_id, senderId, text, createdAt}` where `senderId` is either a
//!   bare id or a populated profile object.
//!
//! Every inbound field is optional; deciding what is usable is left to the
//! consumer.

use serde::{Deserialize, Deserializer, Serialize};

use crate::message::{MessageId, Timestamp, UserId};

/// A single frame on the socket channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum SocketEvent {
    /// Client to server: join the room for a conversation.
    JoinChat(JoinChat),
    /// Client to server: post a message to the room.
    SendMessage(OutgoingMessage),
    /// Server to client: a message was posted to the room.
    MessageReceived(ReceivedMessage),
    /// Server to client: a request was rejected.
    Error(ErrorPayload),
}

impl SocketEvent {
    /// Wire name of this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinChat(_) => "joinChat",
            Self::SendMessage(_) => "sendMessage",
            Self::MessageReceived(_) => "messageReceived",
            Self::Error(_) => "error",
        }
    }
}

/// Payload of `joinChat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinChat {
    /// The joining user.
    pub user_id: UserId,
    /// The other participant of the conversation.
    pub target_user_id: UserId,
    /// Display name of the joining user.
    #[serde(default)]
    pub first_name: Option<String>,
}

/// Payload of `sendMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// The sending user.
    pub user_id: UserId,
    /// The recipient.
    pub target_user_id: UserId,
    /// Sender's first name at send time.
    #[serde(default)]
    pub first_name: Option<String>,
    /// Sender's last name at send time.
    #[serde(default)]
    pub last_name: Option<String>,
    /// Message body.
    pub text: String,
    /// Local id of the optimistic echo. Servers that echo it back let the
    /// client reconcile without heuristics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<MessageId>,
    /// Client clock at send time.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub created_at: Option<Timestamp>,
}

/// Payload of `messageReceived`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    /// Server id of the persisted message.
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
    /// Sender id in the flat shape some servers use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Sender's first name (legacy shape).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Sender's last name (legacy shape).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
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
    /// Local id the sender attached to its `sendMessage`, echoed back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<MessageId>,
}

impl ReceivedMessage {
    /// Sender id, preferring `senderId` over the flat `userId`.
    #[must_use]
    pub fn sender(&self) -> Option<&UserId> {
        self.sender_id
            .as_ref()
            .map(SenderRef::id)
            .or(self.user_id.as_ref())
    }

    /// Sender first name, preferring the populated profile.
    #[must_use]
    pub fn sender_first_name(&self) -> Option<&str> {
        self.sender_id
            .as_ref()
            .and_then(SenderRef::first_name)
            .or(self.first_name.as_deref())
    }

    /// Sender last name, preferring the populated profile.
    #[must_use]
    pub fn sender_last_name(&self) -> Option<&str> {
        self.sender_id
            .as_ref()
            .and_then(SenderRef::last_name)
            .or(self.last_name.as_deref())
    }
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable reason.
    #[serde(default)]
    pub message: String,
}

/// Public profile fields the backend populates into message payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// Profile id.
    #[serde(rename = "_id", alias = "id")]
    pub id: UserId,
    /// First name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Last name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

/// A sender reference: either a bare user id or a populated profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SenderRef {
    /// Unpopulated reference.
    Id(UserId),
    /// Populated profile.
    Profile(UserProfile),
}

impl SenderRef {
    /// The referenced user id.
    #[must_use]
    pub const fn id(&self) -> &UserId {
        match self {
            Self::Id(id) => id,
            Self::Profile(p) => &p.id,
        }
    }

    /// First name, when the reference is populated.
    #[must_use]
    pub fn first_name(&self) -> Option<&str> {
        match self {
            Self::Id(_) => None,
            Self::Profile(p) => p.first_name.as_deref(),
        }
    }

    /// Last name, when the reference is populated.
    #[must_use]
    pub fn last_name(&self) -> Option<&str> {
        match self {
            Self::Id(_) => None,
            Self::Profile(p) => p.last_name.as_deref(),
        }
    }
}

/// Deserialize an optional timestamp, mapping unparseable values to `None`
/// instead of failing the whole payload.
pub(crate) fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<Timestamp>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|v| serde_json::from_value(v).ok()))
}
