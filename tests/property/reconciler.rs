#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Property-based tests for timeline reconciliation.
//!
//! Uses proptest to verify, for arbitrary interleavings of history, local
//! sends and socket deliveries:
//! 1. The timeline is always ordered by `created_at`.
//! 2. No id appears twice.
//! 3. Every delivered server id ends up in the timeline exactly once.
//! 4. Seeding is idempotent.

use std::collections::HashSet;

use proptest::prelude::*;

use devconnect::chat::message::{DeliveryState, Message};
use devconnect::chat::reconciler::{MessageReconciler, RemoteMessage};
use devconnect_proto::message::{ConversationKey, MessageId, Timestamp, UserId};

const TEXTS: [&str; 4] = ["hi", "hello", "ok", "see you"];

#[derive(Debug, Clone)]
enum Op {
    Local {
        text: usize,
        at: u64,
    },
    Remote {
        id: u8,
        from_local: bool,
        text: usize,
        at: u64,
        echo_of: Option<usize>,
    },
    Fail {
        local: usize,
    },
}

fn message(id: MessageId, sender: &str, text: &str, at: u64) -> Message {
    Message {
        id,
        conversation_key: ConversationKey::for_pair(&UserId::new("alice"), &UserId::new("bob")),
        sender_id: UserId::new(sender),
        sender_first_name: None,
        sender_last_name: None,
        text: text.to_string(),
        created_at: Timestamp::from_millis(at),
        delivery_state: DeliveryState::Sent,
    }
}

fn arb_history() -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec((0u8..12, any::<bool>(), 0..TEXTS.len(), 0u64..100_000), 0..12)
        .prop_map(|entries| {
            entries
                .into_iter()
                .map(|(id, mine, text, at)| {
                    message(
                        MessageId::new(format!("h{id}")),
                        if mine { "alice" } else { "bob" },
                        TEXTS[text],
                        at,
                    )
                })
                .collect()
        })
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..TEXTS.len(), 0u64..100_000).prop_map(|(text, at)| Op::Local { text, at }),
        (
            0u8..8,
            any::<bool>(),
            0..TEXTS.len(),
            0u64..100_000,
            prop::option::of(0usize..8),
        )
            .prop_map(|(id, from_local, text, at, echo_of)| Op::Remote {
                id,
                from_local,
                text,
                at,
                echo_of,
            }),
        (0usize..8).prop_map(|local| Op::Fail { local }),
    ]
}

fn assert_well_formed(reconciler: &MessageReconciler) {
    let timeline = reconciler.timeline();
    assert!(
        timeline.windows(2).all(|w| w[0].created_at <= w[1].created_at),
        "timeline out of order: {timeline:?}"
    );
    let ids: HashSet<&MessageId> = timeline.iter().map(|m| &m.id).collect();
    assert_eq!(ids.len(), timeline.len(), "duplicate ids: {timeline:?}");
}

proptest! {
    #[test]
    fn timeline_stays_ordered_and_unique(history in arb_history(), ops in prop::collection::vec(arb_op(), 0..40)) {
        let reconciler = MessageReconciler::new();
        reconciler.seed(history);
        assert_well_formed(&reconciler);

        let mut locals: Vec<MessageId> = Vec::new();
        let mut delivered: HashSet<MessageId> = HashSet::new();

        for op in ops {
            match op {
                Op::Local { text, at } => {
                    let id = reconciler.append_local(message(
                        MessageId::generate(),
                        "alice",
                        TEXTS[text],
                        at,
                    ));
                    locals.push(id);
                }
                Op::Remote { id, from_local, text, at, echo_of } => {
                    let id = MessageId::new(format!("s{id}"));
                    delivered.insert(id.clone());
                    reconciler.append_remote(RemoteMessage {
                        message: message(
                            id,
                            if from_local { "alice" } else { "bob" },
                            TEXTS[text],
                            at,
                        ),
                        echo_of: echo_of.and_then(|i| locals.get(i).cloned()),
                    });
                }
                Op::Fail { local } => {
                    if let Some(id) = locals.get(local) {
                        reconciler.mark_failed(id);
                    }
                }
            }
            assert_well_formed(&reconciler);
        }

        let timeline = reconciler.timeline();
        for id in &delivered {
            prop_assert_eq!(timeline.iter().filter(|m| &m.id == id).count(), 1);
        }
        for m in timeline.iter().filter(|m| delivered.contains(&m.id)) {
            prop_assert_eq!(m.delivery_state, DeliveryState::Sent);
        }
    }

    #[test]
    fn seeding_is_idempotent(history in arb_history()) {
        let once = MessageReconciler::new();
        once.seed(history.clone());

        let twice = MessageReconciler::new();
        twice.seed(history.clone());
        twice.seed(history);

        prop_assert_eq!(once.timeline(), twice.timeline());
    }

    #[test]
    fn history_duplicates_keep_first(history in arb_history()) {
        let reconciler = MessageReconciler::new();
        reconciler.seed(history.clone());

        let mut seen = HashSet::new();
        let expected: HashSet<(MessageId, String)> = history
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .map(|m| (m.id, m.text))
            .collect();
        let actual: HashSet<(MessageId, String)> = reconciler
            .timeline()
            .into_iter()
            .map(|m| (m.id, m.text))
            .collect();
        prop_assert_eq!(actual, expected);
    }
}
