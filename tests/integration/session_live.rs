#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for live chat sessions against the development relay.
//!
//! Two sessions (alice and bob) talk over real WebSocket connections with
//! history served by the relay's REST endpoint: delivery, optimistic echo
//! confirmation, history on reopen, and reload.
//!
//! Verification command: `cargo test --test session_live`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use devconnect::chat::history::HttpHistoryLoader;
use devconnect::chat::message::{DeliveryState, Participant};
use devconnect::chat::socket::ConnectionState;
use devconnect::chat::{ChatSession, SessionConfig, SessionEvent, SessionState};
use devconnect::transport::websocket::WebSocketConnector;
use devconnect_proto::message::{ConversationKey, UserId};
use devconnect_relay::relay::{RelayState, start_server_with_state};

type LiveSession = ChatSession<HttpHistoryLoader, WebSocketConnector>;

// =============================================================================
// Test helpers
// =============================================================================

async fn start_relay() -> (String, Arc<RelayState>) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay");
    (format!("http://{addr}"), state)
}

fn open(
    base: &str,
    user: &str,
    first_name: &str,
    peer: &str,
) -> (LiveSession, mpsc::Receiver<SessionEvent>) {
    let ws_url = format!("{}/socket/ws", base.replacen("http://", "ws://", 1));
    let connector = WebSocketConnector::new(ws_url).with_auth_token(Some(user.to_string()));
    let history = HttpHistoryLoader::new(base)
        .unwrap()
        .with_auth_token(Some(user.to_string()));
    ChatSession::open(
        SessionConfig::default(),
        Participant::new(user).with_name(Some(first_name.to_string()), None),
        UserId::new(peer),
        history,
        connector,
    )
}

/// Wait until the session has history and a live socket.
async fn wait_ready(session: &LiveSession) {
    wait_until(|| session.state() == SessionState::Ready(ConnectionState::Connected)).await;
}

/// Wait until `count` connections have joined the alice/bob room.
async fn wait_joined(state: &RelayState, count: usize) {
    let key = ConversationKey::for_pair(&UserId::new("alice"), &UserId::new("bob"));
    for _ in 0..100 {
        if state.rooms.members(&key).await.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("room never reached {count} members");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within 5s");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn message_reaches_peer_and_confirms_sender() {
    let (base, state) = start_relay().await;
    let (alice, _alice_events) = open(&base, "alice", "Alice", "bob");
    let (bob, _bob_events) = open(&base, "bob", "Bob", "alice");
    wait_ready(&alice).await;
    wait_ready(&bob).await;
    wait_joined(&state, 2).await;

    let local_id = alice.send_message("  hello bob ").await.unwrap();

    wait_until(|| bob.timeline().len() == 1).await;
    wait_until(|| {
        alice
            .timeline()
            .first()
            .is_some_and(|m| m.delivery_state == DeliveryState::Sent)
    })
    .await;

    let received = &bob.timeline()[0];
    assert_eq!(received.text, "hello bob");
    assert_eq!(received.sender_id, UserId::new("alice"));
    assert_eq!(received.sender_first_name.as_deref(), Some("Alice"));
    assert_eq!(received.delivery_state, DeliveryState::Sent);

    let mine = alice.timeline();
    assert_eq!(mine.len(), 1, "echo must replace the local copy");
    assert_eq!(mine[0].id, received.id, "local id is replaced by the server id");
    assert_ne!(mine[0].id, local_id);
}

#[tokio::test]
async fn conversation_order_is_shared() {
    let (base, state) = start_relay().await;
    let (alice, _alice_events) = open(&base, "alice", "Alice", "bob");
    let (bob, _bob_events) = open(&base, "bob", "Bob", "alice");
    wait_ready(&alice).await;
    wait_ready(&bob).await;
    wait_joined(&state, 2).await;

    alice.send_message("one").await.unwrap();
    wait_until(|| bob.timeline().len() == 1).await;
    bob.send_message("two").await.unwrap();
    wait_until(|| alice.timeline().len() == 2).await;
    alice.send_message("three").await.unwrap();
    wait_until(|| bob.timeline().len() == 3 && alice.timeline().len() == 3).await;

    let texts = |s: &LiveSession| s.timeline().into_iter().map(|m| m.text).collect::<Vec<_>>();
    assert_eq!(texts(&alice), ["one", "two", "three"]);
    assert_eq!(texts(&bob), ["one", "two", "three"]);
}

#[tokio::test]
async fn reopened_session_loads_history() {
    let (base, state) = start_relay().await;
    let (alice, _alice_events) = open(&base, "alice", "Alice", "bob");
    wait_ready(&alice).await;
    wait_joined(&state, 1).await;

    alice.send_message("first").await.unwrap();
    alice.send_message("second").await.unwrap();
    wait_until(|| {
        alice
            .timeline()
            .iter()
            .all(|m| m.delivery_state == DeliveryState::Sent)
    })
    .await;

    let (bob, mut bob_events) = open(&base, "bob", "Bob", "alice");
    let loaded = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match bob_events.recv().await {
                Some(SessionEvent::HistoryLoaded { count }) => return count,
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("history never loaded");
    assert_eq!(loaded, 2);

    let timeline = bob.timeline();
    assert_eq!(timeline[0].text, "first");
    assert_eq!(timeline[1].text, "second");
    assert!(timeline.iter().all(|m| m.sender_id == UserId::new("alice")));
    assert_eq!(
        timeline.iter().map(|m| &m.id).collect::<Vec<_>>(),
        alice.timeline().iter().map(|m| &m.id).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn reload_does_not_duplicate_messages() {
    let (base, state) = start_relay().await;
    let (alice, _alice_events) = open(&base, "alice", "Alice", "bob");
    let (bob, _bob_events) = open(&base, "bob", "Bob", "alice");
    wait_ready(&alice).await;
    wait_ready(&bob).await;
    wait_joined(&state, 2).await;

    alice.send_message("hello").await.unwrap();
    bob.send_message("hi").await.unwrap();
    wait_until(|| bob.timeline().len() == 2 && alice.timeline().len() == 2).await;
    wait_until(|| {
        alice
            .timeline()
            .iter()
            .all(|m| m.delivery_state == DeliveryState::Sent)
    })
    .await;

    let summary = |s: &LiveSession| {
        s.timeline()
            .into_iter()
            .map(|m| (m.id, m.text, m.delivery_state))
            .collect::<Vec<_>>()
    };
    let before = summary(&alice);
    assert_eq!(alice.reload_history().await.unwrap(), 2);
    assert_eq!(summary(&alice), before);
}

#[tokio::test]
async fn closed_session_ignores_later_messages() {
    let (base, state) = start_relay().await;
    let (alice, _alice_events) = open(&base, "alice", "Alice", "bob");
    let (bob, _bob_events) = open(&base, "bob", "Bob", "alice");
    wait_ready(&alice).await;
    wait_ready(&bob).await;
    wait_joined(&state, 2).await;

    bob.close();
    alice.send_message("anyone there?").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(bob.state(), SessionState::Closed);
    assert!(bob.timeline().is_empty());
    assert!(bob.send_message("late").await.is_err());
}
