//! Connection State Machine
//!
//! Per-connection lifecycle state, subscribed rooms, and the bounded
//! retry queue. The registry owns one [`ConnectionMeta`] per live socket;
//! everything here is process-local and dies with the connection.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Maximum buffered frames per connection awaiting redelivery
pub const RETRY_QUEUE_CAPACITY: usize = 50;

/// How long a buffered frame is worth resending
pub const RETRY_ENTRY_TTL: Duration = Duration::from_secs(60);

/// Connection lifecycle states.
///
/// `Disconnected` is reachable from every other state; all other
/// transitions follow the adjacency table in [`ConnectionState::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Authenticated,
    Subscribed,
    Disconnected,
}

impl ConnectionState {
    /// Adjacency table for lifecycle transitions. Out-of-order transitions
    /// (e.g. `Connecting -> Subscribed`) are rejected by the registry.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connected, Authenticated)
                | (Authenticated, Subscribed)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Authenticated, Disconnected)
                | (Subscribed, Disconnected)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

/// A frame buffered for redelivery, stamped at enqueue time.
#[derive(Debug, Clone)]
pub struct RetryEntry<T> {
    pub frame: T,
    pub enqueued_at: Instant,
}

/// Bounded FIFO of frames awaiting redelivery.
///
/// Capacity is fixed at [`RETRY_QUEUE_CAPACITY`]; enqueueing into a full
/// queue evicts the oldest entry. Draining drops entries older than
/// [`RETRY_ENTRY_TTL`].
#[derive(Debug)]
pub struct RetryQueue<T> {
    entries: VecDeque<RetryEntry<T>>,
}

impl<T> RetryQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(RETRY_QUEUE_CAPACITY),
        }
    }

    /// Append a frame, evicting the oldest entry when full. Returns true
    /// when an eviction occurred.
    pub fn enqueue(&mut self, frame: T) -> bool {
        let evicted = if self.entries.len() >= RETRY_QUEUE_CAPACITY {
            self.entries.pop_front();
            true
        } else {
            false
        };
        self.entries.push_back(RetryEntry {
            frame,
            enqueued_at: Instant::now(),
        });
        evicted
    }

    /// Remove and return all non-expired entries, silently dropping the
    /// expired ones.
    pub fn drain(&mut self) -> Vec<T> {
        let now = Instant::now();
        self.entries
            .drain(..)
            .filter(|e| now.duration_since(e.enqueued_at) < RETRY_ENTRY_TTL)
            .map(|e| e.frame)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn backdate_all(&mut self, age: Duration) {
        for entry in &mut self.entries {
            if let Some(at) = Instant::now().checked_sub(age) {
                entry.enqueued_at = at;
            }
        }
    }
}

impl<T> Default for RetryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection metadata owned by the registry.
#[derive(Debug)]
pub struct ConnectionMeta<T> {
    pub user_id: Uuid,
    pub state: ConnectionState,
    pub rooms: HashSet<Uuid>,
    pub retry_queue: RetryQueue<T>,
    pub reconnect_attempts: u32,
}

impl<T> ConnectionMeta<T> {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            state: ConnectionState::Connecting,
            rooms: HashSet::new(),
            retry_queue: RetryQueue::new(),
            reconnect_attempts: 0,
        }
    }

    /// Validated transition. On rejection the state is left unchanged and
    /// false is returned; callers must not assume success.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Subscribe to a room. A duplicate add is a no-op reported as failure.
    pub fn add_room(&mut self, room_id: Uuid) -> bool {
        self.rooms.insert(room_id)
    }

    /// Unsubscribe from a room. Removing an unknown room reports failure.
    pub fn remove_room(&mut self, room_id: Uuid) -> bool {
        self.rooms.remove(&room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    use ConnectionState::*;

    #[test_case(Connecting, Connected => true)]
    #[test_case(Connected, Authenticated => true)]
    #[test_case(Authenticated, Subscribed => true)]
    #[test_case(Connecting, Subscribed => false; "cannot skip to subscribed")]
    #[test_case(Connecting, Authenticated => false; "cannot skip to authenticated")]
    #[test_case(Connected, Subscribed => false)]
    #[test_case(Subscribed, Authenticated => false; "no backwards transition")]
    #[test_case(Connecting, Disconnected => true)]
    #[test_case(Connected, Disconnected => true)]
    #[test_case(Authenticated, Disconnected => true)]
    #[test_case(Subscribed, Disconnected => true)]
    #[test_case(Disconnected, Connected => false; "disconnected is terminal")]
    #[test_case(Connected, Connected => false; "self transition rejected")]
    fn adjacency_table(from: ConnectionState, to: ConnectionState) -> bool {
        from.can_transition_to(to)
    }

    #[test]
    fn rejected_transition_leaves_state_unchanged() {
        let mut meta: ConnectionMeta<u32> = ConnectionMeta::new(Uuid::new_v4());
        assert!(!meta.transition(Subscribed));
        assert_eq!(meta.state, Connecting);

        assert!(meta.transition(Connected));
        assert!(!meta.transition(Subscribed));
        assert_eq!(meta.state, Connected);
    }

    #[test]
    fn duplicate_room_add_reports_failure() {
        let room = Uuid::new_v4();
        let mut meta: ConnectionMeta<u32> = ConnectionMeta::new(Uuid::new_v4());
        assert!(meta.add_room(room));
        assert!(!meta.add_room(room));
        assert_eq!(meta.rooms.len(), 1);

        assert!(meta.remove_room(room));
        assert!(!meta.remove_room(room));
    }

    #[test]
    fn retry_queue_is_bounded_and_evicts_oldest() {
        let mut queue = RetryQueue::new();
        for i in 0..(RETRY_QUEUE_CAPACITY + 10) {
            queue.enqueue(i);
        }
        assert_eq!(queue.len(), RETRY_QUEUE_CAPACITY);

        let drained = queue.drain();
        // The first ten entries were evicted to make room.
        assert_eq!(drained.first(), Some(&10));
        assert_eq!(drained.len(), RETRY_QUEUE_CAPACITY);
    }

    #[test]
    fn drain_excludes_expired_entries() {
        let mut queue = RetryQueue::new();
        queue.enqueue("stale");
        queue.backdate_all(RETRY_ENTRY_TTL + Duration::from_secs(1));
        queue.enqueue("fresh");

        let drained = queue.drain();
        assert_eq!(drained, vec!["fresh"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_before_ttl_returns_entries_unchanged() {
        let mut queue = RetryQueue::new();
        queue.enqueue("a");
        queue.enqueue("b");
        assert_eq!(queue.drain(), vec!["a", "b"]);
    }
}
