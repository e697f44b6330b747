//! Gateway Service
//!
//! Orchestrates the per-connection message flow: validation -> rate
//! limiting -> moderation hook -> broadcast -> durable routing ->
//! delivery tracking -> acknowledgment. One instance is created at
//! startup and shared by every socket handler.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GatewaySettings;
use crate::domain::connection::ConnectionState;
use crate::domain::delivery::DeliveryStatus;
use crate::domain::message::RoomMessage;
use crate::domain::moderation::Moderator;
use crate::infrastructure::breaker::CircuitBreaker;
use crate::infrastructure::cache::{keys, CoordinationStore};
use crate::infrastructure::delivery::DeliveryTracker;
use crate::infrastructure::metrics;
use crate::infrastructure::rate_limit::RoomRateLimiter;
use crate::infrastructure::stream::StreamRouter;
use crate::presentation::websocket::broadcast::BroadcastEngine;
use crate::presentation::websocket::messages::{
    parse_room_id, parse_user_id, validate_body, Envelope, MessagePayload, OutboundFrame,
};
use crate::presentation::websocket::registry::ConnectionRegistry;
use crate::shared::error::{ErrorCode, GatewayError};

/// Orchestrator wiring inbound envelopes through the gateway core.
pub struct GatewayService {
    registry: Arc<ConnectionRegistry>,
    broadcast: Arc<BroadcastEngine>,
    limiter: RoomRateLimiter,
    router: Arc<StreamRouter>,
    delivery: DeliveryTracker,
    moderator: Arc<dyn Moderator>,
    moderation_breaker: Arc<CircuitBreaker>,
    store: Arc<dyn CoordinationStore>,
    settings: GatewaySettings,
}

impl GatewayService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        broadcast: Arc<BroadcastEngine>,
        limiter: RoomRateLimiter,
        router: Arc<StreamRouter>,
        delivery: DeliveryTracker,
        moderator: Arc<dyn Moderator>,
        moderation_breaker: Arc<CircuitBreaker>,
        store: Arc<dyn CoordinationStore>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            registry,
            broadcast,
            limiter,
            router,
            delivery,
            moderator,
            moderation_breaker,
            store,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Transport reported a new connection. Registers it and advances it
    /// to `Connected`; the user id is attached later by `identify`.
    pub fn connection_open(
        &self,
        conn_id: Uuid,
        sender: tokio::sync::mpsc::UnboundedSender<OutboundFrame>,
    ) -> bool {
        // The user is unknown until the auth collaborator attaches one;
        // register under the nil user and fix it up on identify.
        if !self.registry.register(conn_id, Uuid::nil(), sender) {
            return false;
        }
        self.registry.transition(conn_id, ConnectionState::Connected)
    }

    /// Attach the authenticated user to the connection. Must run before
    /// the first message is processed.
    pub fn identify(&self, conn_id: Uuid, raw_user_id: &str) -> Result<Uuid, GatewayError> {
        let user_id = parse_user_id(raw_user_id)?;
        if !self
            .registry
            .transition(conn_id, ConnectionState::Authenticated)
        {
            return Err(GatewayError::Validation(ErrorCode::InvalidUserId));
        }
        self.registry.attach_user(conn_id, user_id);
        self.registry.reset_reconnect_attempts(conn_id);

        // Frames buffered for this connection while it was identifying.
        for frame in self.registry.drain_retry_queue(conn_id) {
            self.registry.send_to(conn_id, frame);
        }

        info!(conn_id = %conn_id, user_id = %user_id, "Connection identified");
        Ok(user_id)
    }

    /// Transport reported the socket closed. Synchronously removes the
    /// connection from all local indices; advisory room counters are
    /// released best-effort.
    pub async fn connection_close(&self, conn_id: Uuid) {
        let Some((user_id, rooms)) = self.registry.unregister(conn_id) else {
            return;
        };
        debug!(conn_id = %conn_id, user_id = %user_id, "Connection closed");
        for room_id in rooms {
            self.release_room_slot(room_id).await;
        }
    }

    /// Handle one inbound envelope. Errors are mapped to coded frames by
    /// the caller; anything unexpected becomes `message_processing_failed`
    /// there as well.
    pub async fn handle_envelope(
        &self,
        conn_id: Uuid,
        user_id: Uuid,
        envelope: Envelope,
    ) -> Result<(), GatewayError> {
        match envelope {
            Envelope::Identify { .. } => {
                // Already identified; a repeat is an out-of-order
                // transition and is reported as such.
                Err(GatewayError::Validation(ErrorCode::InvalidUserId))
            }
            Envelope::ChatMessage {
                room_id,
                msg_id,
                payload,
                requires_ack,
            } => {
                self.handle_chat_message(conn_id, user_id, &room_id, msg_id, payload, requires_ack)
                    .await
            }
            Envelope::JoinRoom { room_id } => self.join_room(conn_id, &room_id).await,
            Envelope::LeaveRoom { room_id } => self.leave_room(conn_id, &room_id).await,
            Envelope::DeliveryAck { msg_id, status } => {
                self.handle_delivery_ack(conn_id, user_id, msg_id, status)
                    .await
            }
        }
    }

    async fn handle_chat_message(
        &self,
        conn_id: Uuid,
        user_id: Uuid,
        raw_room_id: &str,
        msg_id: Option<Uuid>,
        payload: MessagePayload,
        requires_ack: bool,
    ) -> Result<(), GatewayError> {
        let room_id = parse_room_id(raw_room_id)?;
        if !self.registry.is_member(conn_id, room_id) {
            return Err(GatewayError::Validation(ErrorCode::InvalidRoomId));
        }
        let content = validate_body(&payload, self.settings.max_message_bytes)?;

        // Advisory throttle; fails open inside the limiter.
        self.limiter.check(user_id, room_id).await?;

        let mut msg = RoomMessage::new(room_id, user_id, content, requires_ack);
        if let Some(client_id) = msg_id {
            msg.msg_id = client_id;
        }

        // Moderation runs synchronously but never blocks delivery; any
        // failure is logged only.
        self.moderate(conn_id, &msg).await;

        // Fan-out first: live delivery is the latency-critical path.
        let delivery = self.broadcast.publish(msg.clone()).await;

        // Durable append fails closed: skip and alert rather than
        // pretending the message was made durable.
        if let Err(err) = self.router.route(&msg).await {
            metrics::record_stream_append_failure();
            error!(
                msg_id = %msg.msg_id,
                room_id = %room_id,
                error = %err,
                "Durable append failed; message delivered live but not journaled"
            );
        }

        if msg.requires_ack && !delivery.delivered_users.is_empty() {
            if let Err(err) = self
                .delivery
                .mark_pending(msg.msg_id, &delivery.delivered_users)
                .await
            {
                warn!(msg_id = %msg.msg_id, error = %err, "Failed to record pending deliveries");
            }
        }

        self.registry.send_to(conn_id, OutboundFrame::ack(msg.msg_id));
        Ok(())
    }

    async fn moderate(&self, conn_id: Uuid, msg: &RoomMessage) {
        let moderator = Arc::clone(&self.moderator);
        let (content, room_id, msg_id, user_id) =
            (msg.content.clone(), msg.room_id, msg.msg_id, msg.user_id);

        let verdict = self
            .moderation_breaker
            .call(move || async move { moderator.scan(&content, room_id, msg_id, user_id).await })
            .await;

        match verdict {
            Ok(verdict) if verdict.is_toxic => {
                self.registry.send_to(
                    conn_id,
                    OutboundFrame::ModerationWarning {
                        msg_id: msg.msg_id,
                        score: verdict.score,
                        suggestion: verdict.suggestion,
                    },
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    msg_id = %msg.msg_id,
                    error = %GatewayError::from(err),
                    "Moderation scan failed; delivering unmoderated"
                );
            }
        }
    }

    /// Join a room, enforcing the configured participant cap through the
    /// advisory cross-process counter. Best-effort: slight overshoot under
    /// races is accepted, and a store outage does not block joins.
    async fn join_room(&self, conn_id: Uuid, raw_room_id: &str) -> Result<(), GatewayError> {
        let room_id = parse_room_id(raw_room_id)?;

        if self.registry.is_member(conn_id, room_id) {
            // Duplicate join is a no-op reported as failure by the
            // registry; clients see silence rather than an error code.
            debug!(conn_id = %conn_id, room_id = %room_id, "Duplicate join ignored");
            return Ok(());
        }

        let key = keys::room_connections(room_id);
        match self.store.incr(&key).await {
            Ok(count) => {
                let _ = self
                    .store
                    .expire(&key, self.settings.room_counter_ttl_secs)
                    .await;
                if count > self.settings.max_room_connections as i64 {
                    if let Err(err) = self.store.decr(&key).await {
                        warn!(room_id = %room_id, error = %err, "Failed to roll back room counter");
                    }
                    return Err(GatewayError::RoomFull);
                }
            }
            Err(err) => {
                // Advisory counter only: joining must not stall on store
                // trouble.
                warn!(room_id = %room_id, error = %err, "Room counter unavailable, admitting join");
            }
        }

        self.registry.add_room(conn_id, room_id);
        // First room promotes the connection to Subscribed; later joins
        // leave the state untouched.
        self.registry
            .transition(conn_id, ConnectionState::Subscribed);
        debug!(conn_id = %conn_id, room_id = %room_id, "Joined room");
        Ok(())
    }

    async fn leave_room(&self, conn_id: Uuid, raw_room_id: &str) -> Result<(), GatewayError> {
        let room_id = parse_room_id(raw_room_id)?;
        if self.registry.remove_room(conn_id, room_id) {
            self.release_room_slot(room_id).await;
            debug!(conn_id = %conn_id, room_id = %room_id, "Left room");
        }
        Ok(())
    }

    async fn handle_delivery_ack(
        &self,
        conn_id: Uuid,
        user_id: Uuid,
        msg_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), GatewayError> {
        // Duplicate acks are no-ops inside the tracker; both outcomes are
        // confirmed to the client.
        self.delivery.ack(msg_id, user_id, status).await?;
        self.registry
            .send_to(conn_id, OutboundFrame::delivery_ack_confirmed(msg_id));
        Ok(())
    }

    async fn release_room_slot(&self, room_id: Uuid) {
        if let Err(err) = self.store.decr(&keys::room_connections(room_id)).await {
            debug!(room_id = %room_id, error = %err, "Failed to release room counter slot");
        }
    }
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService").finish_non_exhaustive()
    }
}
