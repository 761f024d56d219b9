//! Text-frame codec for socket events.
//!
//! Each event is one JSON document. Stream transports (WebSocket) carry one
//! document per text frame. The long-polling transport packs several
//! documents into one HTTP body separated by [`RECORD_SEPARATOR`].

use serde::{Deserialize, Serialize};

use crate::event::SocketEvent;

/// Separator between frames in a long-polling body (ASCII RS).
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Response body of the long-polling handshake (`POST {poll_path}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollHandshake {
    /// Session id to use in subsequent poll and send requests.
    pub sid: String,
}

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame is not a well-formed socket event.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Encodes a [`SocketEvent`] into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode(event: &SocketEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`SocketEvent`] from a JSON text frame.
///
/// Unknown event names and payloads that do not match the event's shape are
/// both reported as malformed.
///
/// # Errors
///
/// Returns `CodecError::Malformed` if the frame cannot be decoded.
pub fn decode(frame: &str) -> Result<SocketEvent, CodecError> {
    serde_json::from_str(frame).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Joins already-encoded frames into one long-polling body.
#[must_use]
pub fn encode_batch<S: AsRef<str>>(frames: &[S]) -> String {
    let mut body = String::new();
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            body.push(RECORD_SEPARATOR);
        }
        body.push_str(frame.as_ref());
    }
    body
}

/// Splits a long-polling body into frames, skipping empty segments.
pub fn split_batch(body: &str) -> impl Iterator<Item = &str> {
    body.split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ErrorPayload, JoinChat};
    use crate::message::UserId;

    fn join() -> SocketEvent {
        SocketEvent::JoinChat(JoinChat {
            user_id: UserId::new("a"),
            target_user_id: UserId::new("b"),
            first_name: None,
        })
    }

    #[test]
    fn encode_produces_event_envelope() {
        let frame = encode(&join()).unwrap();
        assert!(frame.starts_with(r#"{"event":"joinChat","data":"#));
        assert_eq!(decode(&frame).unwrap(), join());
    }

    #[test]
    fn decode_rejects_unknown_event() {
        let result = decode(r#"{"event":"typing","data":{}}"#);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_non_json() {
        assert!(matches!(decode("hello"), Err(CodecError::Malformed(_))));
        assert!(matches!(decode(""), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_wrong_payload_shape() {
        let result = decode(r#"{"event":"joinChat","data":{"userId":"a"}}"#);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn batch_preserves_frame_order() {
        let err = SocketEvent::Error(ErrorPayload {
            message: "x".into(),
        });
        let frames = vec![encode(&join()).unwrap(), encode(&err).unwrap()];
        let body = encode_batch(&frames);
        let split: Vec<&str> = split_batch(&body).collect();
        assert_eq!(split, vec![frames[0].as_str(), frames[1].as_str()]);
    }

    #[test]
    fn split_skips_empty_segments() {
        let body = format!("{RECORD_SEPARATOR}a{RECORD_SEPARATOR}{RECORD_SEPARATOR}b\n");
        let split: Vec<&str> = split_batch(&body).collect();
        assert_eq!(split, vec!["a", "b"]);
        assert_eq!(split_batch("").count(), 0);
    }
}
