//! Room registry for the relay server.
//!
//! A room is the set of connections that joined a conversation. The key is
//! the conversation key of the participant pair, so both sides of a chat
//! land in the same room regardless of who joins first. A connection may
//! sit in several rooms and leaves all of them when it closes.
//!
//! Room entries are ephemeral and lost on relay restart.

use std::collections::{HashMap, HashSet};
use std::fmt;

use devconnect_proto::message::ConversationKey;
use tokio::sync::RwLock;

/// Relay-local identifier of one socket connection (WebSocket or polling
/// session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Default)]
struct Rooms {
    members: HashMap<ConversationKey, HashSet<ConnId>>,
    joined: HashMap<ConnId, HashSet<ConversationKey>>,
}

/// In-memory mapping between rooms and connections.
///
/// Thread-safe via [`RwLock`].
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<Rooms>,
}

impl RoomRegistry {
    /// Creates a new, empty room registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` to the room `key`.
    ///
    /// Returns `false` if the connection was already a member.
    pub async fn join(&self, key: &ConversationKey, conn: ConnId) -> bool {
        let mut rooms = self.rooms.write().await;
        let added = rooms.members.entry(key.clone()).or_default().insert(conn);
        rooms.joined.entry(conn).or_default().insert(key.clone());
        drop(rooms);
        added
    }

    /// Removes `conn` from every room, returning how many it left.
    ///
    /// Rooms that become empty are dropped.
    pub async fn leave_all(&self, conn: ConnId) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(keys) = rooms.joined.remove(&conn) else {
            return 0;
        };
        for key in &keys {
            if let Some(members) = rooms.members.get_mut(key) {
                members.remove(&conn);
                if members.is_empty() {
                    rooms.members.remove(key);
                }
            }
        }
        drop(rooms);
        keys.len()
    }

    /// Returns the connections currently in room `key`.
    pub async fn members(&self, key: &ConversationKey) -> Vec<ConnId> {
        let rooms = self.rooms.read().await;
        let mut members: Vec<ConnId> = rooms
            .members
            .get(key)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        drop(rooms);
        members.sort_unstable();
        members
    }

    /// Returns the number of non-empty rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devconnect_proto::message::UserId;

    fn key(a: &str, b: &str) -> ConversationKey {
        ConversationKey::for_pair(&UserId::new(a), &UserId::new(b))
    }

    #[tokio::test]
    async fn both_sides_share_a_room() {
        let rooms = RoomRegistry::new();
        assert!(rooms.join(&key("alice", "bob"), ConnId(1)).await);
        assert!(rooms.join(&key("bob", "alice"), ConnId(2)).await);
        assert_eq!(
            rooms.members(&key("alice", "bob")).await,
            vec![ConnId(1), ConnId(2)]
        );
        assert_eq!(rooms.room_count().await, 1);
    }

    #[tokio::test]
    async fn joining_twice_is_idempotent() {
        let rooms = RoomRegistry::new();
        assert!(rooms.join(&key("a", "b"), ConnId(1)).await);
        assert!(!rooms.join(&key("a", "b"), ConnId(1)).await);
        assert_eq!(rooms.members(&key("a", "b")).await.len(), 1);
    }

    #[tokio::test]
    async fn leave_all_cleans_up_every_room() {
        let rooms = RoomRegistry::new();
        rooms.join(&key("a", "b"), ConnId(1)).await;
        rooms.join(&key("a", "c"), ConnId(1)).await;
        rooms.join(&key("a", "c"), ConnId(2)).await;

        assert_eq!(rooms.leave_all(ConnId(1)).await, 2);
        assert!(rooms.members(&key("a", "b")).await.is_empty());
        assert_eq!(rooms.members(&key("a", "c")).await, vec![ConnId(2)]);
        assert_eq!(rooms.room_count().await, 1);
        assert_eq!(rooms.leave_all(ConnId(1)).await, 0);
    }

    #[tokio::test]
    async fn other_conversations_are_isolated() {
        let rooms = RoomRegistry::new();
        rooms.join(&key("alice", "bob"), ConnId(1)).await;
        rooms.join(&key("alice", "carol"), ConnId(2)).await;
        assert_eq!(rooms.members(&key("alice", "bob")).await, vec![ConnId(1)]);
    }
}
