//! Timeline reconciliation.
//!
//! The [`MessageReconciler`] is the single authority for what a chat view
//! displays. It merges loaded history, optimistic local echoes and messages
//! received over the socket into one list that is:
//!
//! - sorted by `created_at` ascending, ties broken by insertion order;
//! - free of duplicate ids;
//! - free of double-rendered echoes: when the server's copy of a local
//!   message arrives, the local entry is promoted in place instead of a
//!   second entry being added.
//!
//! Every operation takes one internal lock, so concurrent callers see a
//! linearizable sequence of timeline states.

use std::collections::HashSet;
use std::time::Duration;

use devconnect_proto::message::MessageId;
use parking_lot::Mutex;

use super::message::{DeliveryState, Message};

/// Default window within which a remote message may be matched to a local
/// echo by content.
pub const DEFAULT_ECHO_TOLERANCE: Duration = Duration::from_secs(10);

/// A message received from the socket, plus the local id the server echoed
/// back (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    /// The normalized message.
    pub message: Message,
    /// Local id of the optimistic echo this message confirms.
    pub echo_of: Option<MessageId>,
}

impl From<Message> for RemoteMessage {
    fn from(message: Message) -> Self {
        Self {
            message,
            echo_of: None,
        }
    }
}

/// What [`MessageReconciler::append_remote`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Added as a new entry.
    Inserted(MessageId),
    /// Merged into a local echo, which now carries the server id.
    Promoted {
        /// Id the echo had before promotion.
        local_id: MessageId,
        /// Id it carries now.
        id: MessageId,
    },
    /// Already present; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    History,
    Local,
    Remote,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    seq: u64,
    origin: Origin,
    /// For local entries: whether the server copy has been matched.
    reconciled: bool,
}

impl Entry {
    const fn is_unreconciled_local(&self) -> bool {
        matches!(self.origin, Origin::Local) && !self.reconciled
    }

    fn sort_key(&self) -> (u64, u64) {
        (self.message.created_at.as_millis(), self.seq)
    }
}

#[derive(Debug, Default)]
struct Timeline {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl Timeline {
    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|e| &e.message.id == id)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert_sorted(&mut self, entry: Entry) {
        let key = entry.sort_key();
        let idx = self.entries.partition_point(|e| e.sort_key() <= key);
        self.entries.insert(idx, entry);
    }

    fn push(&mut self, message: Message, origin: Origin, reconciled: bool) {
        let seq = self.next_seq();
        self.insert_sorted(Entry {
            message,
            seq,
            origin,
            reconciled,
        });
    }

    /// Merge the server copy into the local entry at `idx`.
    fn promote(&mut self, idx: usize, server: Message) -> RemoteOutcome {
        let mut entry = self.entries.remove(idx);
        let local_id = std::mem::replace(&mut entry.message.id, server.id.clone());
        entry.message.created_at = server.created_at;
        entry.message.delivery_state = DeliveryState::Sent;
        if entry.message.sender_first_name.is_none() {
            entry.message.sender_first_name = server.sender_first_name;
        }
        if entry.message.sender_last_name.is_none() {
            entry.message.sender_last_name = server.sender_last_name;
        }
        entry.reconciled = true;
        self.insert_sorted(entry);
        RemoteOutcome::Promoted {
            local_id,
            id: server.id,
        }
    }

    fn load(&mut self, history: Vec<Message>) {
        self.entries.clear();
        self.next_seq = 0;
        let mut seen = HashSet::with_capacity(history.len());
        for message in history {
            if !seen.insert(message.id.clone()) {
                tracing::debug!(id = %message.id, "duplicate id in history, keeping first");
                continue;
            }
            let seq = self.next_seq();
            self.entries.push(Entry {
                message,
                seq,
                origin: Origin::History,
                reconciled: true,
            });
        }
        self.entries.sort_by_key(Entry::sort_key);
    }
}

/// Whether `server` is plausibly the server copy of the local `local`.
fn is_echo(local: &Message, server: &Message, tolerance_ms: u64) -> bool {
    local.sender_id == server.sender_id
        && local.text == server.text
        && local.created_at.abs_diff(server.created_at) <= tolerance_ms
}

/// Merges history, local echoes and socket messages into one timeline.
pub struct MessageReconciler {
    timeline: Mutex<Timeline>,
    echo_tolerance_ms: u64,
}

impl Default for MessageReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageReconciler {
    /// Create an empty reconciler with the default echo tolerance.
    #[must_use]
    pub fn new() -> Self {
        Self::with_echo_tolerance(DEFAULT_ECHO_TOLERANCE)
    }

    /// Create an empty reconciler with a custom echo tolerance.
    #[must_use]
    pub fn with_echo_tolerance(tolerance: Duration) -> Self {
        Self {
            timeline: Mutex::new(Timeline::default()),
            echo_tolerance_ms: u64::try_from(tolerance.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Replace the whole timeline with `history`.
    ///
    /// Duplicate ids keep their first occurrence. Seeding twice with the same
    /// input yields the same timeline as seeding once.
    pub fn seed(&self, history: Vec<Message>) {
        self.timeline.lock().load(history);
    }

    /// Replace the timeline with `history`, carrying over local echoes that
    /// have not been matched with a server copy yet.
    ///
    /// Used when history is reloaded while the conversation is live, so
    /// messages still in flight (or failed) stay visible. A carried echo
    /// whose server copy is in `history` (same sender and text, within the
    /// echo tolerance) is dropped in favour of it. Returns the
    /// `(local_id, server_id)` pairs matched that way.
    pub fn reseed(&self, history: Vec<Message>) -> Vec<(MessageId, MessageId)> {
        let mut timeline = self.timeline.lock();
        let carried: Vec<Message> = timeline
            .entries
            .iter()
            .filter(|e| e.is_unreconciled_local())
            .map(|e| e.message.clone())
            .collect();
        timeline.load(history);

        let mut claimed = HashSet::new();
        let mut matched = Vec::new();
        for message in carried {
            if timeline.position(&message.id).is_some() {
                continue;
            }
            let server = timeline.entries.iter().position(|e| {
                e.origin == Origin::History
                    && !claimed.contains(&e.message.id)
                    && is_echo(&message, &e.message, self.echo_tolerance_ms)
            });
            if let Some(idx) = server {
                let id = timeline.entries[idx].message.id.clone();
                tracing::debug!(local = %message.id, id = %id, "reloaded history holds local echo");
                claimed.insert(id.clone());
                matched.push((message.id, id));
                continue;
            }
            timeline.push(message, Origin::Local, false);
        }
        matched
    }

    /// Append an optimistic local message as `Pending`.
    ///
    /// An empty id is replaced with a generated one. If the id is already in
    /// the timeline nothing changes. Returns the message's id.
    pub fn append_local(&self, mut message: Message) -> MessageId {
        if message.id.is_empty() {
            message.id = MessageId::generate();
        }
        let id = message.id.clone();

        let mut timeline = self.timeline.lock();
        if timeline.position(&id).is_some() {
            tracing::debug!(id = %id, "local message already in timeline");
            return id;
        }
        message.delivery_state = DeliveryState::Pending;
        timeline.push(message, Origin::Local, false);
        id
    }

    /// Append a message received from the socket.
    ///
    /// Matching against existing entries, first rule wins:
    /// 1. same id: promote it if it is an unmatched local echo, else ignore;
    /// 2. `echo_of` names an unmatched local echo: promote that entry;
    /// 3. the oldest unmatched local echo with the same sender and text
    ///    whose `created_at` is within the echo tolerance: promote it.
    ///
    /// Otherwise the message is inserted as `Sent`.
    pub fn append_remote(&self, remote: impl Into<RemoteMessage>) -> RemoteOutcome {
        let RemoteMessage {
            mut message,
            echo_of,
        } = remote.into();
        if message.id.is_empty() {
            message.id = MessageId::generate();
        }

        let mut timeline = self.timeline.lock();

        if let Some(idx) = timeline.position(&message.id) {
            if timeline.entries[idx].is_unreconciled_local() {
                return timeline.promote(idx, message);
            }
            tracing::debug!(id = %message.id, "duplicate remote message ignored");
            return RemoteOutcome::Duplicate;
        }

        if let Some(local_id) = &echo_of
            && let Some(idx) = timeline
                .entries
                .iter()
                .position(|e| e.is_unreconciled_local() && &e.message.id == local_id)
        {
            tracing::debug!(local = %local_id, id = %message.id, "echo matched by client id");
            return timeline.promote(idx, message);
        }

        let tolerance = self.echo_tolerance_ms;
        if let Some(idx) = timeline
            .entries
            .iter()
            .position(|e| e.is_unreconciled_local() && is_echo(&e.message, &message, tolerance))
        {
            tracing::debug!(id = %message.id, "echo matched by content");
            return timeline.promote(idx, message);
        }

        message.delivery_state = DeliveryState::Sent;
        let id = message.id.clone();
        timeline.push(message, Origin::Remote, true);
        RemoteOutcome::Inserted(id)
    }

    /// Move a `Pending` message to `Failed`. Returns whether it changed.
    pub fn mark_failed(&self, id: &MessageId) -> bool {
        self.transition(id, DeliveryState::Failed)
    }

    /// Move a `Pending` message to `Sent` without matching it to a server
    /// copy. The entry can still be promoted when the echo arrives.
    pub fn mark_sent(&self, id: &MessageId) -> bool {
        self.transition(id, DeliveryState::Sent)
    }

    fn transition(&self, id: &MessageId, next: DeliveryState) -> bool {
        let mut timeline = self.timeline.lock();
        let Some(idx) = timeline.position(id) else {
            return false;
        };
        let entry = &mut timeline.entries[idx];
        if entry.message.delivery_state != DeliveryState::Pending {
            return false;
        }
        entry.message.delivery_state = next;
        true
    }

    /// Remove a `Failed` message, returning it. Other states are left alone.
    pub fn discard(&self, id: &MessageId) -> Option<Message> {
        let mut timeline = self.timeline.lock();
        let idx = timeline.position(id)?;
        if timeline.entries[idx].message.delivery_state != DeliveryState::Failed {
            return None;
        }
        Some(timeline.entries.remove(idx).message)
    }

    /// Ordered snapshot of the timeline.
    #[must_use]
    pub fn timeline(&self) -> Vec<Message> {
        self.timeline
            .lock()
            .entries
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Look up one message by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<Message> {
        let timeline = self.timeline.lock();
        timeline
            .position(id)
            .map(|idx| timeline.entries[idx].message.clone())
    }

    /// Number of messages in the timeline.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timeline.lock().entries.len()
    }

    /// Whether the timeline is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timeline.lock().entries.is_empty()
    }
}
