#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for socket reconnection against the development relay.
//!
//! The relay drops every connection; clients come back with backoff,
//! re-join their room, and keep exchanging messages. With a bounded
//! attempt budget and the relay gone, the client settles in
//! `Disconnected`.
//!
//! Verification command: `cargo test --test socket_reconnect`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use devconnect::chat::message::{DeliveryState, Message, Participant};
use devconnect::chat::reconciler::RemoteMessage;
use devconnect::chat::socket::{ChatSocketClient, ConnectionState, ReconnectConfig};
use devconnect::transport::websocket::WebSocketConnector;
use devconnect_proto::message::{ConversationKey, MessageId, Timestamp, UserId};
use devconnect_relay::relay::{RelayState, start_server_with_state};
use devconnect_relay::rooms::ConnId;

// =============================================================================
// Test helpers
// =============================================================================

fn fast_reconnect(max_attempts: Option<u32>) -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_attempts,
    }
}

fn client(
    addr: std::net::SocketAddr,
    user: &str,
    reconnect: ReconnectConfig,
) -> ChatSocketClient<WebSocketConnector> {
    let connector = WebSocketConnector::new(format!("ws://{addr}/socket/ws"))
        .with_auth_token(Some(user.to_string()))
        .with_connect_timeout(Duration::from_secs(1));
    ChatSocketClient::new(connector, reconnect)
}

fn room() -> ConversationKey {
    ConversationKey::for_pair(&UserId::new("alice"), &UserId::new("bob"))
}

/// Wait until the room holds `count` members, none of them in `stale`.
async fn wait_members(state: &RelayState, count: usize, stale: &[ConnId]) -> Vec<ConnId> {
    for _ in 0..200 {
        let members = state.rooms.members(&room()).await;
        if members.len() == count && members.iter().all(|m| !stale.contains(m)) {
            return members;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("room never reached {count} fresh members");
}

fn outgoing(from: &str, to: &str, text: &str) -> Message {
    let sender = UserId::new(from);
    Message {
        id: MessageId::generate(),
        conversation_key: ConversationKey::for_pair(&sender, &UserId::new(to)),
        sender_id: sender,
        sender_first_name: None,
        sender_last_name: None,
        text: text.to_string(),
        created_at: Timestamp::now(),
        delivery_state: DeliveryState::Pending,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn clients_rejoin_after_relay_drops_connections() {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let alice = client(addr, "alice", fast_reconnect(None));
    let bob = client(addr, "bob", fast_reconnect(None));
    let (tx, mut alice_inbox) = mpsc::unbounded_channel::<RemoteMessage>();
    alice.on_message(move |remote| {
        let _ = tx.send(remote);
    });

    alice
        .connect(Participant::new("alice"), UserId::new("bob"))
        .await
        .unwrap();
    bob.connect(Participant::new("bob"), UserId::new("alice"))
        .await
        .unwrap();
    let before = wait_members(&state, 2, &[]).await;

    state.close_all_connections().await;
    wait_members(&state, 2, &before).await;

    let mut alice_state = alice.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        alice_state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("alice never reconnected")
    .unwrap();
    let mut bob_state = bob.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        bob_state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("bob never reconnected")
    .unwrap();

    bob.send(&outgoing("bob", "alice", "still here"))
        .await
        .unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), alice_inbox.recv())
        .await
        .expect("no message after reconnect")
        .unwrap();
    assert_eq!(received.message.text, "still here");
    assert_eq!(received.message.sender_id, UserId::new("bob"));
}

#[tokio::test]
async fn reconnect_gives_up_after_attempt_budget() {
    let state = Arc::new(RelayState::new());
    let (addr, handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let alice = client(addr, "alice", fast_reconnect(Some(2)));
    alice
        .connect(Participant::new("alice"), UserId::new("bob"))
        .await
        .unwrap();
    wait_members(&state, 1, &[]).await;

    // Stop accepting, then drop the live connection.
    handle.abort();
    let _ = handle.await;
    state.close_all_connections().await;

    let mut states = alice.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .expect("client kept retrying")
    .unwrap();
    assert!(matches!(
        alice.send(&outgoing("alice", "bob", "lost")).await,
        Err(devconnect::chat::socket::SocketError::NotConnected)
    ));
}

#[tokio::test]
async fn disconnect_is_final() {
    let (addr, _handle) = devconnect_relay::relay::start_server("127.0.0.1:0")
        .await
        .unwrap();
    let alice = client(addr, "alice", fast_reconnect(None));
    alice
        .connect(Participant::new("alice"), UserId::new("bob"))
        .await
        .unwrap();

    alice.disconnect();
    assert_eq!(alice.state(), ConnectionState::Disconnected);
    assert!(
        alice
            .connect(Participant::new("alice"), UserId::new("bob"))
            .await
            .is_err()
    );
}
