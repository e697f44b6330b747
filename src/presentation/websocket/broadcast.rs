//! Broadcast Engine
//!
//! At-least-once fan-out of room messages. Local subscribers get direct
//! delivery for lowest latency; every message is also relayed through the
//! shared pub/sub channel so peer processes deliver to their own
//! subscribers. Relay writes are coalesced into short time-windowed
//! batches per room, with bounded queues that drop the oldest entries
//! under overload.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::messages::OutboundFrame;
use super::registry::ConnectionRegistry;
use crate::config::BroadcastSettings;
use crate::domain::message::RoomMessage;
use crate::infrastructure::metrics;
use crate::infrastructure::relay::{RelayFrame, RelayTransport};

/// Result of one local fan-out pass.
#[derive(Debug, Default, Clone)]
pub struct LocalDelivery {
    /// Users that received the message on this process
    pub delivered_users: Vec<Uuid>,
    /// Sockets whose write failed and were detached from the room
    pub failed: usize,
}

/// Room-scoped fan-out across local sockets and peer processes.
pub struct BroadcastEngine {
    registry: Arc<ConnectionRegistry>,
    relay: Arc<dyn RelayTransport>,
    /// This process's identity, stamped on every relay frame so the
    /// receiving edge can discard our own frames
    origin: Uuid,
    settings: BroadcastSettings,
    /// Per-room pending relay entries awaiting the next flush
    batches: DashMap<Uuid, VecDeque<RoomMessage>>,
}

impl BroadcastEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        relay: Arc<dyn RelayTransport>,
        settings: BroadcastSettings,
    ) -> Self {
        Self {
            registry,
            relay,
            origin: Uuid::new_v4(),
            settings,
            batches: DashMap::new(),
        }
    }

    /// Id stamped on outgoing relay frames.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Publish a message to a room: immediate local delivery plus an
    /// enqueued relay write for peers.
    pub async fn publish(&self, msg: RoomMessage) -> LocalDelivery {
        let delivery = self.deliver_local(&msg);
        metrics::record_published();

        if let Some((room_id, batch)) = self.enqueue_for_relay(msg) {
            // The batch hit its size threshold; flush without waiting for
            // the timer.
            self.publish_relay(room_id, batch).await;
        }

        delivery
    }

    /// Deliver to every locally-connected subscriber of the room. A failed
    /// write detaches that connection from the room index without
    /// aborting delivery to the remaining sockets.
    fn deliver_local(&self, msg: &RoomMessage) -> LocalDelivery {
        let mut delivery = LocalDelivery::default();

        for member in self.registry.room_members(msg.room_id) {
            let frame = OutboundFrame::message(msg);
            if member.sender.send(frame).is_ok() {
                delivery.delivered_users.push(member.user_id);
            } else {
                self.registry.handle_send_failure(
                    member.conn_id,
                    msg.room_id,
                    OutboundFrame::message(msg),
                );
                delivery.failed += 1;
            }
        }

        delivery
    }

    /// Queue a message for the next relay flush. Returns a drained batch
    /// when the size threshold was reached.
    fn enqueue_for_relay(&self, msg: RoomMessage) -> Option<(Uuid, Vec<RoomMessage>)> {
        let room_id = msg.room_id;
        let mut batch = self.batches.entry(room_id).or_default();

        if batch.len() >= self.settings.max_pending {
            // Explicit backpressure: bound memory by dropping the oldest
            // unsent entries.
            batch.pop_front();
            metrics::record_broadcast_dropped(1);
            warn!(room_id = %room_id, "Relay batch over capacity, dropped oldest entry");
        }
        batch.push_back(msg);

        if batch.len() >= self.settings.batch_max_messages {
            let drained: Vec<RoomMessage> = batch.drain(..).collect();
            Some((room_id, drained))
        } else {
            None
        }
    }

    /// Flush every non-empty room batch. Called by the flusher task on
    /// each tick.
    pub async fn flush_all(&self) {
        let rooms: Vec<Uuid> = self
            .batches
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| *e.key())
            .collect();

        for room_id in rooms {
            let drained: Vec<RoomMessage> = self
                .batches
                .get_mut(&room_id)
                .map(|mut batch| batch.drain(..).collect())
                .unwrap_or_default();
            if !drained.is_empty() {
                self.publish_relay(room_id, drained).await;
            }
        }
    }

    async fn publish_relay(&self, room_id: Uuid, messages: Vec<RoomMessage>) {
        let frame = RelayFrame {
            origin: self.origin,
            room_id,
            messages,
        };
        match self.relay.publish(&frame).await {
            Ok(()) => metrics::record_relay_batch(),
            Err(err) => {
                // Local delivery already happened; peers will miss this
                // batch until the relay recovers.
                warn!(room_id = %room_id, error = %err, "Relay publish failed");
            }
        }
    }

    /// Deliver a frame received from a peer process. Frames stamped with
    /// our own origin are discarded; local-direct plus relay can never
    /// double-deliver on the originating process.
    pub fn handle_relay_frame(&self, frame: RelayFrame) {
        if frame.origin == self.origin {
            return;
        }
        debug!(
            room_id = %frame.room_id,
            count = frame.messages.len(),
            "Delivering relayed batch"
        );
        for msg in &frame.messages {
            self.deliver_local(msg);
        }
    }

    /// Spawn the periodic batch flusher.
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = Duration::from_millis(engine.settings.flush_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.flush_all().await;
            }
        })
    }

    /// Number of entries currently awaiting relay for a room.
    pub fn pending_relay(&self, room_id: Uuid) -> usize {
        self.batches.get(&room_id).map(|b| b.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for BroadcastEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastEngine")
            .field("origin", &self.origin)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::relay::MockRelayTransport;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    fn settings() -> BroadcastSettings {
        BroadcastSettings {
            flush_interval_ms: 50,
            batch_max_messages: 3,
            max_pending: 5,
            relay_channel: "gateway:relay".into(),
        }
    }

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        engine: Arc<BroadcastEngine>,
        published: Arc<Mutex<Vec<RelayFrame>>>,
    }

    fn harness(settings: BroadcastSettings) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);

        let mut relay = MockRelayTransport::new();
        relay.expect_publish().returning(move |frame| {
            sink.lock().push(frame.clone());
            Ok(())
        });

        let engine = Arc::new(BroadcastEngine::new(
            Arc::clone(&registry),
            Arc::new(relay),
            settings,
        ));
        Harness {
            registry,
            engine,
            published,
        }
    }

    fn join(harness: &Harness, room: Uuid) -> (Uuid, mpsc::UnboundedReceiver<OutboundFrame>) {
        let conn = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        harness.registry.register(conn, Uuid::new_v4(), tx);
        harness.registry.add_room(conn, room);
        (conn, rx)
    }

    fn msg(room: Uuid) -> RoomMessage {
        RoomMessage::new(room, Uuid::new_v4(), "hi".into(), false)
    }

    #[tokio::test]
    async fn delivers_locally_and_batches_relay() {
        let h = harness(settings());
        let room = Uuid::new_v4();
        let (_conn, mut rx) = join(&h, room);

        let delivery = h.engine.publish(msg(room)).await;
        assert_eq!(delivery.delivered_users.len(), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            OutboundFrame::Message { .. }
        ));

        // Below the size threshold: nothing relayed until a flush.
        assert!(h.published.lock().is_empty());
        assert_eq!(h.engine.pending_relay(room), 1);

        h.engine.flush_all().await;
        assert_eq!(h.published.lock().len(), 1);
        assert_eq!(h.engine.pending_relay(room), 0);
    }

    #[tokio::test]
    async fn size_threshold_flushes_early() {
        let h = harness(settings());
        let room = Uuid::new_v4();

        for _ in 0..3 {
            h.engine.publish(msg(room)).await;
        }
        let frames = h.published.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].messages.len(), 3);
    }

    #[tokio::test]
    async fn overfull_batch_drops_oldest() {
        let mut s = settings();
        s.batch_max_messages = 100; // never flush by size
        s.max_pending = 5;
        let h = harness(s);
        let room = Uuid::new_v4();

        let mut first_id = None;
        for i in 0..6 {
            let m = msg(room);
            if i == 0 {
                first_id = Some(m.msg_id);
            }
            h.engine.publish(m).await;
        }

        assert_eq!(h.engine.pending_relay(room), 5);
        h.engine.flush_all().await;
        let frames = h.published.lock();
        // The oldest entry was dropped under backpressure.
        assert!(frames[0].messages.iter().all(|m| Some(m.msg_id) != first_id));
    }

    #[tokio::test]
    async fn failed_socket_detaches_without_aborting_delivery() {
        let h = harness(settings());
        let room = Uuid::new_v4();
        let (dead_conn, dead_rx) = join(&h, room);
        let (_live_conn, mut live_rx) = join(&h, room);
        drop(dead_rx);

        let delivery = h.engine.publish(msg(room)).await;
        assert_eq!(delivery.delivered_users.len(), 1);
        assert_eq!(delivery.failed, 1);
        assert!(live_rx.try_recv().is_ok());
        assert!(!h.registry.is_member(dead_conn, room));
    }

    #[tokio::test]
    async fn own_relay_frames_are_discarded() {
        let h = harness(settings());
        let room = Uuid::new_v4();
        let (_conn, mut rx) = join(&h, room);

        let own = RelayFrame {
            origin: h.engine.origin(),
            room_id: room,
            messages: vec![msg(room)],
        };
        h.engine.handle_relay_frame(own);
        assert!(rx.try_recv().is_err());

        let foreign = RelayFrame {
            origin: Uuid::new_v4(),
            room_id: room,
            messages: vec![msg(room)],
        };
        h.engine.handle_relay_frame(foreign);
        assert!(rx.try_recv().is_ok());
    }
}
