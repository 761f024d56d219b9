//! Domain types for the chat timeline.

use std::fmt;

use devconnect_proto::message::{ConversationKey, MessageId, Timestamp, UserId};

/// Placeholder shown for senders whose names are unknown.
pub const UNKNOWN_SENDER: &str = "Unknown";

/// Delivery lifecycle of a message in the timeline.
///
/// `Pending` only moves forward; `Sent` and `Failed` never go back to
/// `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Shown optimistically, not yet confirmed.
    Pending,
    /// Confirmed by the server (or received from it).
    Sent,
    /// Transmission failed or was never confirmed.
    Failed,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One side of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// User id.
    pub id: UserId,
    /// First name, if known.
    pub first_name: Option<String>,
    /// Last name, if known.
    pub last_name: Option<String>,
}

impl Participant {
    /// A participant known only by id.
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            first_name: None,
            last_name: None,
        }
    }

    /// Attach display names.
    #[must_use]
    pub fn with_name(mut self, first: Option<String>, last: Option<String>) -> Self {
        self.first_name = first;
        self.last_name = last;
        self
    }
}

/// A single chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server id, or a generated local id while unconfirmed.
    pub id: MessageId,
    /// Room the message belongs to.
    pub conversation_key: ConversationKey,
    /// Sender id.
    pub sender_id: UserId,
    /// Sender first name at send time.
    pub sender_first_name: Option<String>,
    /// Sender last name at send time.
    pub sender_last_name: Option<String>,
    /// Message body, non-empty after trimming.
    pub text: String,
    /// Client clock for unconfirmed messages, server clock afterwards.
    pub created_at: Timestamp,
    /// Delivery lifecycle state.
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Sender name for display, with a placeholder for unknown senders.
    #[must_use]
    pub fn sender_display_name(&self) -> String {
        match (&self.sender_first_name, &self.sender_last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(name), None) | (None, Some(name)) => name.clone(),
            (None, None) => UNKNOWN_SENDER.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(first: Option<&str>, last: Option<&str>) -> Message {
        Message {
            id: MessageId::new("m"),
            conversation_key: ConversationKey::for_pair(&UserId::new("a"), &UserId::new("b")),
            sender_id: UserId::new("a"),
            sender_first_name: first.map(str::to_string),
            sender_last_name: last.map(str::to_string),
            text: "hi".into(),
            created_at: Timestamp::from_millis(0),
            delivery_state: DeliveryState::Sent,
        }
    }

    #[test]
    fn display_name_uses_placeholder() {
        assert_eq!(message(None, None).sender_display_name(), UNKNOWN_SENDER);
        assert_eq!(message(Some("Ada"), None).sender_display_name(), "Ada");
        assert_eq!(
            message(Some("Ada"), Some("Lovelace")).sender_display_name(),
            "Ada Lovelace"
        );
    }

    #[test]
    fn participant_builder() {
        let p = Participant::new(UserId::new("u1")).with_name(Some("Ada".into()), None);
        assert_eq!(p.id.as_str(), "u1");
        assert_eq!(p.first_name.as_deref(), Some("Ada"));
    }
}
