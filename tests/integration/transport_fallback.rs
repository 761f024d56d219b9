#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for transport fallback.
//!
//! A client whose WebSocket endpoint is unusable falls back to
//! long-polling and still exchanges messages with a peer that is on a
//! WebSocket.
//!
//! Verification command: `cargo test --test transport_fallback`

use std::time::Duration;

use tokio::sync::mpsc;

use devconnect::chat::message::{DeliveryState, Message, Participant};
use devconnect::chat::reconciler::RemoteMessage;
use devconnect::chat::socket::{ChatSocketClient, ConnectionState, ReconnectConfig};
use devconnect::transport::hybrid::HybridConnector;
use devconnect::transport::polling::PollingConnector;
use devconnect::transport::websocket::WebSocketConnector;
use devconnect::transport::{Connector, Transport, TransportType};
use devconnect_proto::message::{ConversationKey, MessageId, Timestamp, UserId};

// =============================================================================
// Test helpers
// =============================================================================

async fn start_relay() -> std::net::SocketAddr {
    let (addr, _handle) = devconnect_relay::relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay");
    addr
}

/// Hybrid connector whose preferred WebSocket URL points at a missing path.
fn broken_ws_hybrid(
    addr: std::net::SocketAddr,
    user: &str,
) -> HybridConnector<WebSocketConnector, PollingConnector> {
    HybridConnector::new(
        WebSocketConnector::new(format!("ws://{addr}/no-such-socket"))
            .with_auth_token(Some(user.to_string())),
        PollingConnector::new(&format!("http://{addr}"), "/socket/poll")
            .unwrap()
            .with_auth_token(Some(user.to_string())),
    )
}

fn ws_connector(addr: std::net::SocketAddr, user: &str) -> WebSocketConnector {
    WebSocketConnector::new(format!("ws://{addr}/socket/ws")).with_auth_token(Some(user.to_string()))
}

fn collect_messages<C: Connector>(
    client: &ChatSocketClient<C>,
) -> mpsc::UnboundedReceiver<RemoteMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on_message(move |remote| {
        let _ = tx.send(remote);
    });
    rx
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

async fn next_message(rx: &mut mpsc::UnboundedReceiver<RemoteMessage>) -> RemoteMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message within 5s")
        .expect("handler channel closed")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn hybrid_falls_back_to_polling() {
    let addr = start_relay().await;
    let transport = broken_ws_hybrid(addr, "alice").connect().await.unwrap();
    assert_eq!(transport.transport_type(), TransportType::Polling);
    assert!(transport.is_connected());
    transport.close().await;
}

#[tokio::test]
async fn hybrid_prefers_websocket_when_available() {
    let addr = start_relay().await;
    let hybrid = HybridConnector::new(
        ws_connector(addr, "alice"),
        PollingConnector::new(&format!("http://{addr}"), "/socket/poll")
            .unwrap()
            .with_auth_token(Some("alice".into())),
    );
    let transport = hybrid.connect().await.unwrap();
    assert_eq!(transport.transport_type(), TransportType::WebSocket);
}

#[tokio::test]
async fn polling_client_talks_to_websocket_client() {
    let addr = start_relay().await;

    let alice = ChatSocketClient::new(broken_ws_hybrid(addr, "alice"), ReconnectConfig::default());
    let bob = ChatSocketClient::new(ws_connector(addr, "bob"), ReconnectConfig::default());
    let mut alice_inbox = collect_messages(&alice);
    let mut bob_inbox = collect_messages(&bob);

    alice
        .connect(
            Participant::new("alice").with_name(Some("Alice".into()), None),
            UserId::new("bob"),
        )
        .await
        .unwrap();
    bob.connect(
        Participant::new("bob").with_name(Some("Bob".into()), None),
        UserId::new("alice"),
    )
    .await
    .unwrap();
    assert_eq!(alice.transport_type(), Some(TransportType::Polling));
    assert_eq!(bob.transport_type(), Some(TransportType::WebSocket));
    assert_eq!(alice.state(), ConnectionState::Connected);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sent = outgoing("alice", "bob", "via polling");
    alice.send(&sent).await.unwrap();

    let at_bob = next_message(&mut bob_inbox).await;
    assert_eq!(at_bob.message.text, "via polling");
    assert_eq!(at_bob.message.sender_id, UserId::new("alice"));

    let echo = next_message(&mut alice_inbox).await;
    assert_eq!(echo.echo_of, Some(sent.id));
    assert_eq!(echo.message.id, at_bob.message.id);

    bob.send(&outgoing("bob", "alice", "via websocket"))
        .await
        .unwrap();
    let at_alice = next_message(&mut alice_inbox).await;
    assert_eq!(at_alice.message.text, "via websocket");
    assert_eq!(at_alice.message.sender_id, UserId::new("bob"));
}

#[tokio::test]
async fn both_transports_unavailable_fails_connect() {
    let hybrid = HybridConnector::new(
        WebSocketConnector::new("ws://127.0.0.1:1/socket/ws"),
        PollingConnector::new("http://127.0.0.1:1", "/socket/poll").unwrap(),
    );
    let client = ChatSocketClient::new(hybrid, ReconnectConfig::default());
    let result = client.connect(Participant::new("alice"), UserId::new("bob")).await;
    assert!(result.is_err());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
