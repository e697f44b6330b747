//! Connection Registry
//!
//! Owns every live connection on this process: lifecycle state, room
//! subscriptions, retry queues, and the outbound channel to the socket
//! writer. Created once at gateway startup and dependency-injected;
//! entries are removed explicitly on disconnect, with a periodic reaper
//! as a safety net.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::messages::OutboundFrame;
use crate::domain::connection::{ConnectionMeta, ConnectionState};
use crate::infrastructure::metrics;

/// A room member snapshot handed to the broadcast engine.
#[derive(Debug, Clone)]
pub struct RoomMember {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub sender: mpsc::UnboundedSender<OutboundFrame>,
}

struct ConnectionEntry {
    meta: ConnectionMeta<OutboundFrame>,
    sender: mpsc::UnboundedSender<OutboundFrame>,
}

/// Registry of all connections owned by this gateway process.
///
/// Invariant: a connection appears in a room's member set iff that room
/// is in the connection's subscribed set.
#[derive(Default)]
pub struct ConnectionRegistry {
    /// Live connections by connection id
    connections: DashMap<Uuid, ConnectionEntry>,
    /// Room id -> member connection ids (local fan-out index)
    rooms: DashMap<Uuid, HashSet<Uuid>>,
    /// User id -> connection ids (one user can hold several sockets)
    users: DashMap<Uuid, HashSet<Uuid>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection in `Connecting` state. Returns false if
    /// the id is already taken.
    pub fn register(
        &self,
        conn_id: Uuid,
        user_id: Uuid,
        sender: mpsc::UnboundedSender<OutboundFrame>,
    ) -> bool {
        if self.connections.contains_key(&conn_id) {
            return false;
        }
        self.connections.insert(
            conn_id,
            ConnectionEntry {
                meta: ConnectionMeta::new(user_id),
                sender,
            },
        );
        self.users.entry(user_id).or_default().insert(conn_id);
        tracing::info!(conn_id = %conn_id, user_id = %user_id, "Connection registered");
        self.publish_gauges();
        true
    }

    /// Validated lifecycle transition. Returns false (state unchanged) for
    /// out-of-adjacency transitions or unknown connections.
    pub fn transition(&self, conn_id: Uuid, next: ConnectionState) -> bool {
        let changed = self
            .connections
            .get_mut(&conn_id)
            .map(|mut entry| entry.meta.transition(next))
            .unwrap_or(false);
        if changed {
            self.publish_gauges();
        }
        changed
    }

    pub fn state(&self, conn_id: Uuid) -> Option<ConnectionState> {
        self.connections.get(&conn_id).map(|e| e.meta.state)
    }

    pub fn user_of(&self, conn_id: Uuid) -> Option<Uuid> {
        self.connections.get(&conn_id).map(|e| e.meta.user_id)
    }

    /// Attach the authenticated user id to a connection that was
    /// registered before identification, re-indexing the user map.
    pub fn attach_user(&self, conn_id: Uuid, user_id: Uuid) {
        let Some(mut entry) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let previous = entry.meta.user_id;
        entry.meta.user_id = user_id;
        drop(entry);

        if previous != user_id {
            if let Some(mut conns) = self.users.get_mut(&previous) {
                conns.remove(&conn_id);
            }
            self.users.remove_if(&previous, |_, conns| conns.is_empty());
            self.users.entry(user_id).or_default().insert(conn_id);
        }
    }

    /// Subscribe a connection to a room, updating both sides of the
    /// membership invariant. A duplicate add is a no-op reported as
    /// failure.
    pub fn add_room(&self, conn_id: Uuid, room_id: Uuid) -> bool {
        let Some(mut entry) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        if !entry.meta.add_room(room_id) {
            return false;
        }
        drop(entry);
        self.rooms.entry(room_id).or_default().insert(conn_id);
        true
    }

    /// Unsubscribe a connection from a room. Removing an unknown room
    /// reports failure.
    pub fn remove_room(&self, conn_id: Uuid, room_id: Uuid) -> bool {
        let Some(mut entry) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        if !entry.meta.remove_room(room_id) {
            return false;
        }
        drop(entry);
        self.detach_from_room(conn_id, room_id);
        true
    }

    pub fn rooms_of(&self, conn_id: Uuid) -> Vec<Uuid> {
        self.connections
            .get(&conn_id)
            .map(|e| e.meta.rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, conn_id: Uuid, room_id: Uuid) -> bool {
        self.connections
            .get(&conn_id)
            .map(|e| e.meta.rooms.contains(&room_id))
            .unwrap_or(false)
    }

    /// Snapshot of a room's local members for fan-out.
    pub fn room_members(&self, room_id: Uuid) -> Vec<RoomMember> {
        let Some(members) = self.rooms.get(&room_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|conn_id| {
                self.connections.get(conn_id).map(|entry| RoomMember {
                    conn_id: *conn_id,
                    user_id: entry.meta.user_id,
                    sender: entry.sender.clone(),
                })
            })
            .collect()
    }

    /// Rooms with at least one local member.
    pub fn room_ids(&self) -> Vec<Uuid> {
        self.rooms
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| *e.key())
            .collect()
    }

    /// Send a frame to one connection. Returns false when the connection
    /// is gone or its socket writer has hung up.
    pub fn send_to(&self, conn_id: Uuid, frame: OutboundFrame) -> bool {
        self.connections
            .get(&conn_id)
            .map(|entry| entry.sender.send(frame).is_ok())
            .unwrap_or(false)
    }

    /// Buffer a frame for later redelivery. The queue is bounded; the
    /// oldest entry is evicted when full.
    pub fn enqueue_retry(&self, conn_id: Uuid, frame: OutboundFrame) -> bool {
        self.connections
            .get_mut(&conn_id)
            .map(|mut entry| {
                let evicted = entry.meta.retry_queue.enqueue(frame);
                if evicted {
                    tracing::debug!(conn_id = %conn_id, "Retry queue full, evicted oldest entry");
                }
                true
            })
            .unwrap_or(false)
    }

    /// Drain all non-expired buffered frames, dropping expired ones.
    pub fn drain_retry_queue(&self, conn_id: Uuid) -> Vec<OutboundFrame> {
        self.connections
            .get_mut(&conn_id)
            .map(|mut entry| entry.meta.retry_queue.drain())
            .unwrap_or_default()
    }

    pub fn increment_reconnect_attempts(&self, conn_id: Uuid) -> u32 {
        self.connections
            .get_mut(&conn_id)
            .map(|mut entry| {
                entry.meta.reconnect_attempts += 1;
                entry.meta.reconnect_attempts
            })
            .unwrap_or(0)
    }

    pub fn reset_reconnect_attempts(&self, conn_id: Uuid) {
        if let Some(mut entry) = self.connections.get_mut(&conn_id) {
            entry.meta.reconnect_attempts = 0;
        }
    }

    /// A socket write failed: buffer the frame for redelivery, bump the
    /// reconnect counter, and drop the connection from that room's local
    /// index so no further writes target the dead socket.
    pub fn handle_send_failure(&self, conn_id: Uuid, room_id: Uuid, frame: OutboundFrame) {
        self.enqueue_retry(conn_id, frame);
        self.increment_reconnect_attempts(conn_id);
        self.remove_room(conn_id, room_id);
        tracing::debug!(
            conn_id = %conn_id,
            room_id = %room_id,
            "Send failed; connection removed from room index"
        );
    }

    /// Remove a connection from every room it was subscribed to and
    /// discard its metadata. Returns the rooms it was in so callers can
    /// release advisory counters.
    pub fn unregister(&self, conn_id: Uuid) -> Option<(Uuid, Vec<Uuid>)> {
        let (_, mut entry) = self.connections.remove(&conn_id)?;
        entry.meta.transition(ConnectionState::Disconnected);

        let rooms: Vec<Uuid> = entry.meta.rooms.iter().copied().collect();
        for room_id in &rooms {
            self.detach_from_room(conn_id, *room_id);
        }

        let user_id = entry.meta.user_id;
        if let Some(mut conns) = self.users.get_mut(&user_id) {
            conns.remove(&conn_id);
        }
        self.users.remove_if(&user_id, |_, conns| conns.is_empty());

        tracing::info!(conn_id = %conn_id, user_id = %user_id, "Connection unregistered");
        self.publish_gauges();
        Some((user_id, rooms))
    }

    /// Safety-net sweep: unregister connections whose socket writer is
    /// gone, forwarding their buffered frames to another live connection
    /// of the same user when one exists. Returns the reaped connections
    /// and the rooms they occupied.
    pub fn reap(&self) -> Vec<(Uuid, Vec<Uuid>)> {
        let dead: Vec<Uuid> = self
            .connections
            .iter()
            .filter(|entry| entry.sender.is_closed())
            .map(|entry| *entry.key())
            .collect();

        let mut reaped = Vec::with_capacity(dead.len());
        for conn_id in dead {
            let buffered = self.drain_retry_queue(conn_id);
            let user_id = self.user_of(conn_id);

            if let Some((user_id, rooms)) = self.unregister(conn_id) {
                reaped.push((user_id, rooms));
            }

            // Best-effort redelivery through a sibling connection.
            if let (Some(user_id), false) = (user_id, buffered.is_empty()) {
                if let Some(sibling) = self.live_connection_of(user_id) {
                    for frame in buffered {
                        self.send_to(sibling, frame);
                    }
                }
            }
        }

        if !reaped.is_empty() {
            tracing::info!(count = reaped.len(), "Reaped dead connections");
        }
        reaped
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.iter().filter(|e| !e.value().is_empty()).count()
    }

    fn live_connection_of(&self, user_id: Uuid) -> Option<Uuid> {
        let conns = self.users.get(&user_id)?;
        conns
            .iter()
            .copied()
            .find(|conn_id| {
                self.connections
                    .get(conn_id)
                    .map(|e| !e.sender.is_closed())
                    .unwrap_or(false)
            })
    }

    fn detach_from_room(&self, conn_id: Uuid, room_id: Uuid) {
        if let Some(mut members) = self.rooms.get_mut(&room_id) {
            members.remove(&conn_id);
        }
        self.rooms.remove_if(&room_id, |_, members| members.is_empty());
    }

    fn publish_gauges(&self) {
        let mut counts = std::collections::HashMap::new();
        for entry in self.connections.iter() {
            *counts.entry(entry.meta.state.as_str()).or_insert(0usize) += 1;
        }
        for state in ["connecting", "connected", "authenticated", "subscribed"] {
            metrics::set_connections(state, counts.get(state).copied().unwrap_or(0));
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("rooms", &self.rooms.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::error::ErrorCode;

    fn channel() -> (
        mpsc::UnboundedSender<OutboundFrame>,
        mpsc::UnboundedReceiver<OutboundFrame>,
    ) {
        mpsc::unbounded_channel()
    }

    fn frame() -> OutboundFrame {
        OutboundFrame::error(ErrorCode::MessageProcessingFailed)
    }

    #[test]
    fn register_is_idempotent_per_id() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();
        let (tx, _rx) = channel();
        assert!(registry.register(conn, Uuid::new_v4(), tx.clone()));
        assert!(!registry.register(conn, Uuid::new_v4(), tx));
    }

    #[test]
    fn membership_invariant_holds_both_ways() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();
        let room = Uuid::new_v4();
        let (tx, _rx) = channel();
        registry.register(conn, Uuid::new_v4(), tx);

        assert!(registry.add_room(conn, room));
        assert!(registry.is_member(conn, room));
        assert_eq!(registry.room_members(room).len(), 1);

        // Duplicate join fails and changes nothing.
        assert!(!registry.add_room(conn, room));
        assert_eq!(registry.room_members(room).len(), 1);

        assert!(registry.remove_room(conn, room));
        assert!(!registry.is_member(conn, room));
        assert!(registry.room_members(room).is_empty());
    }

    #[test]
    fn unregister_clears_every_room() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();
        let (room_a, room_b) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx, _rx) = channel();
        registry.register(conn, Uuid::new_v4(), tx);
        registry.add_room(conn, room_a);
        registry.add_room(conn, room_b);

        let (_, rooms) = registry.unregister(conn).unwrap();
        assert_eq!(rooms.len(), 2);
        assert!(registry.room_members(room_a).is_empty());
        assert!(registry.room_members(room_b).is_empty());
        assert_eq!(registry.connection_count(), 0);

        // Second unregister is a no-op.
        assert!(registry.unregister(conn).is_none());
    }

    #[test]
    fn send_failure_detaches_only_that_room() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();
        let (room_a, room_b) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx, rx) = channel();
        registry.register(conn, Uuid::new_v4(), tx);
        registry.add_room(conn, room_a);
        registry.add_room(conn, room_b);
        drop(rx);

        registry.handle_send_failure(conn, room_a, frame());
        assert!(!registry.is_member(conn, room_a));
        assert!(registry.is_member(conn, room_b));
        assert_eq!(registry.increment_reconnect_attempts(conn), 2);
    }

    #[test]
    fn reaper_removes_connections_with_closed_writers() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let room = Uuid::new_v4();

        let dead = Uuid::new_v4();
        let (dead_tx, dead_rx) = channel();
        registry.register(dead, user, dead_tx);
        registry.add_room(dead, room);
        registry.enqueue_retry(dead, frame());
        drop(dead_rx);

        let alive = Uuid::new_v4();
        let (alive_tx, mut alive_rx) = channel();
        registry.register(alive, user, alive_tx);

        let reaped = registry.reap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(registry.connection_count(), 1);
        // The dead connection's buffered frame moved to the sibling.
        assert!(alive_rx.try_recv().is_ok());
    }

    #[test]
    fn reset_clears_reconnect_counter() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();
        let (tx, _rx) = channel();
        registry.register(conn, Uuid::new_v4(), tx);

        registry.increment_reconnect_attempts(conn);
        registry.increment_reconnect_attempts(conn);
        registry.reset_reconnect_attempts(conn);
        assert_eq!(registry.increment_reconnect_attempts(conn), 1);
    }
}
