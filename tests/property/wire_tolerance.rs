#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Property-based tests for the wire contract.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never makes `decode` panic.
//! 2. Conversation keys do not depend on argument order.
//! 3. Batches split back into the frames they were built from.
//! 4. Arbitrary `createdAt` strings never fail a `messageReceived` payload.
//! 5. Text validation trims and enforces the character limit.

use proptest::prelude::*;

use devconnect_proto::codec;
use devconnect_proto::event::SocketEvent;
use devconnect_proto::message::{ConversationKey, UserId, ValidationError, validate_text};

/// Strategy for user ids as the backend issues them (hex object ids) plus
/// arbitrary short strings.
fn arb_user_id() -> impl Strategy<Value = UserId> {
    prop_oneof!["[0-9a-f]{24}", "[a-zA-Z0-9]{1,16}"].prop_map(UserId::new)
}

proptest! {
    #[test]
    fn decode_never_panics(frame in ".{0,256}") {
        let _ = codec::decode(&frame);
    }

    #[test]
    fn decode_never_panics_on_event_shaped_input(
        event in "[a-zA-Z]{0,16}",
        data in ".{0,128}",
    ) {
        let frame = format!(r#"{{"event":"{event}","data":{data}}}"#);
        let _ = codec::decode(&frame);
    }

    #[test]
    fn conversation_key_is_symmetric(a in arb_user_id(), b in arb_user_id()) {
        prop_assert_eq!(ConversationKey::for_pair(&a, &b), ConversationKey::for_pair(&b, &a));
    }

    #[test]
    fn distinct_pairs_get_distinct_keys(
        a in "[0-9a-f]{24}",
        b in "[0-9a-f]{24}",
        c in "[0-9a-f]{24}",
    ) {
        prop_assume!(b != c);
        let a = UserId::new(a);
        prop_assert_ne!(
            ConversationKey::for_pair(&a, &UserId::new(b)),
            ConversationKey::for_pair(&a, &UserId::new(c))
        );
    }

    #[test]
    fn keys_differ_for_ids_with_separators(
        a in "[a-c_:0-9]{0,6}",
        b in "[a-c_:0-9]{0,6}",
        c in "[a-c_:0-9]{0,6}",
        d in "[a-c_:0-9]{0,6}",
    ) {
        let mut first = [a.clone(), b.clone()];
        let mut second = [c.clone(), d.clone()];
        first.sort();
        second.sort();
        prop_assume!(first != second);
        prop_assert_ne!(
            ConversationKey::for_pair(&UserId::new(a), &UserId::new(b)),
            ConversationKey::for_pair(&UserId::new(c), &UserId::new(d))
        );
    }

    #[test]
    fn batch_splits_into_original_frames(frames in prop::collection::vec("[^\u{1e}\\s][^\u{1e}]{0,64}[^\u{1e}\\s]", 0..8)) {
        let body = codec::encode_batch(&frames);
        let split: Vec<&str> = codec::split_batch(&body).collect();
        prop_assert_eq!(split, frames.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn arbitrary_created_at_never_fails_payload(created_at in "[a-z0-9:\\- ]{0,24}") {
        let frame = format!(
            r#"{{"event":"messageReceived","data":{{"_id":"m1","text":"hi","createdAt":"{created_at}"}}}}"#
        );
        let event = codec::decode(&frame).unwrap();
        let SocketEvent::MessageReceived(message) = event else {
            panic!("expected messageReceived");
        };
        prop_assert_eq!(message.text.as_deref(), Some("hi"));
    }

    #[test]
    fn validation_trims_and_limits(body in "[a-z]{1,40}", pad in " {0,4}", max in 1usize..40) {
        let text = format!("{pad}{body}{pad}");
        match validate_text(&text, Some(max)) {
            Ok(trimmed) => {
                prop_assert_eq!(trimmed, body.as_str());
                prop_assert!(body.len() <= max);
            }
            Err(ValidationError::TooLong { len, max: limit }) => {
                prop_assert_eq!(len, body.len());
                prop_assert_eq!(limit, max);
                prop_assert!(len > max);
            }
            Err(ValidationError::Empty) => prop_assert!(false, "non-blank text reported empty"),
        }
    }
}
