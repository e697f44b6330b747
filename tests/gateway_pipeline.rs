//! End-to-end pipeline tests over the in-memory backing implementations:
//! identify -> join -> publish -> broadcast -> durable routing ->
//! delivery acknowledgment, plus the advertised failure modes.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use uuid::Uuid;

use chat_gateway::domain::delivery::DeliveryStatus;
use chat_gateway::infrastructure::cache::{keys, CoordinationStore, MemoryStore};
use chat_gateway::infrastructure::relay::{NullRelay, RelayTransport};
use chat_gateway::infrastructure::stream::{MemoryStreamLog, GROUP_ARCHIVAL, GROUP_MODERATION};
use chat_gateway::presentation::websocket::OutboundFrame;
use chat_gateway::shared::error::{ErrorCode, GatewayError};

use common::{
    attach_relay_feed, build_gateway, chat_envelope, chat_envelope_with_ack,
    delivery_ack_envelope, join_envelope, GatewayOptions, LoopbackRelay, TestClient,
};

fn single_gateway(options: GatewayOptions) -> common::TestGateway {
    build_gateway(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStreamLog::new()),
        Arc::new(NullRelay),
        options,
    )
}

#[tokio::test]
async fn message_flows_to_room_members_and_is_journaled() {
    let gateway = single_gateway(GatewayOptions::default());
    let room = Uuid::new_v4();

    let mut sender = TestClient::connect(&gateway, &[room]).await;
    let mut receiver = TestClient::connect(&gateway, &[room]).await;

    gateway
        .service
        .handle_envelope(sender.conn_id, sender.user_id, chat_envelope(room, "hello"))
        .await
        .unwrap();

    // Both room members got the message; the sender also got its ack.
    let frames = sender.drain();
    assert!(frames
        .iter()
        .any(|f| matches!(f, OutboundFrame::Message { content, .. } if content == "hello")));
    assert!(frames
        .iter()
        .any(|f| matches!(f, OutboundFrame::MsgAck { status, .. } if *status == "published")));
    assert!(matches!(
        receiver.next_frame(),
        Some(OutboundFrame::Message { .. })
    ));

    // The message was durably appended to the room stream and both
    // cross-cutting streams.
    let room_stream = keys::room_stream(room);
    assert_eq!(gateway.router.len(&room_stream).await.unwrap(), 1);
    assert_eq!(gateway.router.len(keys::ARCHIVAL_STREAM).await.unwrap(), 1);
    assert_eq!(gateway.router.len(keys::MODERATION_STREAM).await.unwrap(), 1);

    // Archival and moderation pipelines consume independently.
    let archived = gateway
        .router
        .consume(keys::ARCHIVAL_STREAM, GROUP_ARCHIVAL, "archiver-1", 10, 0)
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].1.content, "hello");
    let scanned = gateway
        .router
        .consume(keys::MODERATION_STREAM, GROUP_MODERATION, "scanner-1", 10, 0)
        .await
        .unwrap();
    assert_eq!(scanned.len(), 1);
}

#[tokio::test]
async fn non_member_cannot_publish_to_a_room() {
    let gateway = single_gateway(GatewayOptions::default());
    let room = Uuid::new_v4();
    let outsider = TestClient::connect(&gateway, &[]).await;

    let result = gateway
        .service
        .handle_envelope(
            outsider.conn_id,
            outsider.user_id,
            chat_envelope(room, "sneaky"),
        )
        .await;
    assert!(matches!(
        result,
        Err(GatewayError::Validation(ErrorCode::InvalidRoomId))
    ));
}

#[tokio::test]
async fn validation_rejects_before_any_side_effect() {
    let gateway = single_gateway(GatewayOptions::default());
    let room = Uuid::new_v4();
    let client = TestClient::connect(&gateway, &[room]).await;

    let result = gateway
        .service
        .handle_envelope(client.conn_id, client.user_id, chat_envelope(room, "   "))
        .await;
    assert!(matches!(
        result,
        Err(GatewayError::Validation(ErrorCode::EmptyMessage))
    ));

    let result = gateway
        .service
        .handle_envelope(
            client.conn_id,
            client.user_id,
            chat_envelope(room, &"x".repeat(5000)),
        )
        .await;
    assert!(matches!(
        result,
        Err(GatewayError::Validation(ErrorCode::MessageTooLong))
    ));

    // Nothing was journaled for the rejected envelopes.
    assert_eq!(
        gateway.router.len(&keys::room_stream(room)).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn fifteen_messages_pass_then_the_window_closes() {
    let gateway = single_gateway(GatewayOptions::default());
    let room = Uuid::new_v4();
    let mut client = TestClient::connect(&gateway, &[room]).await;

    for i in 0..15 {
        gateway
            .service
            .handle_envelope(
                client.conn_id,
                client.user_id,
                chat_envelope(room, &format!("message {}", i)),
            )
            .await
            .unwrap_or_else(|e| panic!("message {} should pass: {:?}", i, e));
    }

    let result = gateway
        .service
        .handle_envelope(client.conn_id, client.user_id, chat_envelope(room, "one too many"))
        .await;
    match &result {
        Err(GatewayError::RateLimited { reset_at, remaining, .. }) => {
            assert_eq!(*remaining, 0);
            assert!(*reset_at > chrono::Utc::now().timestamp() - 1);
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }

    // The client-facing frame carries the backoff hints.
    let frame = OutboundFrame::from_error(&result.unwrap_err());
    let json = serde_json::to_value(frame).unwrap();
    assert_eq!(json["msg"], "rate_limit_exceeded");
    assert!(json["reset_at"].as_i64().is_some());

    client.drain();
}

#[tokio::test]
async fn window_reopens_after_it_expires() {
    let gateway = single_gateway(GatewayOptions {
        rate_limit: chat_gateway::config::RateLimitSettings {
            max_messages: 2,
            window_seconds: 1,
        },
        ..GatewayOptions::default()
    });
    let room = Uuid::new_v4();
    let client = TestClient::connect(&gateway, &[room]).await;

    for _ in 0..2 {
        gateway
            .service
            .handle_envelope(client.conn_id, client.user_id, chat_envelope(room, "hi"))
            .await
            .unwrap();
    }
    assert!(matches!(
        gateway
            .service
            .handle_envelope(client.conn_id, client.user_id, chat_envelope(room, "hi"))
            .await,
        Err(GatewayError::RateLimited { .. })
    ));

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    gateway
        .service
        .handle_envelope(client.conn_id, client.user_id, chat_envelope(room, "hi"))
        .await
        .expect("window should have reopened");
}

#[tokio::test]
async fn room_rejects_joins_past_capacity() {
    let gateway = single_gateway(GatewayOptions {
        max_room_connections: 2,
        ..GatewayOptions::default()
    });
    let room = Uuid::new_v4();

    let _a = TestClient::connect(&gateway, &[room]).await;
    let _b = TestClient::connect(&gateway, &[room]).await;

    let c = TestClient::connect(&gateway, &[]).await;
    let result = gateway
        .service
        .handle_envelope(c.conn_id, c.user_id, join_envelope(room))
        .await;
    assert!(matches!(result, Err(GatewayError::RoomFull)));

    // The rejected join rolled the advisory counter back.
    let counter = gateway
        .store
        .get(&keys::room_connections(room))
        .await
        .unwrap();
    assert_eq!(counter.as_deref(), Some("2"));

    // A member leaving frees the slot.
    gateway.service.connection_close(_a.conn_id).await;
    gateway
        .service
        .handle_envelope(c.conn_id, c.user_id, join_envelope(room))
        .await
        .expect("slot freed after disconnect");
}

#[tokio::test]
async fn delivery_acks_are_tracked_monotonically() {
    let gateway = single_gateway(GatewayOptions::default());
    let room = Uuid::new_v4();
    let mut sender = TestClient::connect(&gateway, &[room]).await;
    let mut receiver = TestClient::connect(&gateway, &[room]).await;

    gateway
        .service
        .handle_envelope(
            sender.conn_id,
            sender.user_id,
            chat_envelope_with_ack(room, "ack me"),
        )
        .await
        .unwrap();

    let Some(OutboundFrame::Message { msg_id, .. }) = receiver.next_frame() else {
        panic!("receiver should get the message");
    };

    // Pending was recorded for the delivered recipient.
    let record = gateway
        .delivery
        .status(msg_id, receiver.user_id)
        .await
        .unwrap()
        .expect("pending record exists");
    assert_eq!(record.status, DeliveryStatus::Pending);

    // Recipient acknowledges delivery, then read.
    gateway
        .service
        .handle_envelope(
            receiver.conn_id,
            receiver.user_id,
            delivery_ack_envelope(msg_id, "delivered"),
        )
        .await
        .unwrap();
    assert!(matches!(
        receiver.next_frame(),
        Some(OutboundFrame::DeliveryAckConfirmed { .. })
    ));

    gateway
        .service
        .handle_envelope(
            receiver.conn_id,
            receiver.user_id,
            delivery_ack_envelope(msg_id, "read"),
        )
        .await
        .unwrap();

    // A duplicate (and regressing) ack is a no-op.
    gateway
        .service
        .handle_envelope(
            receiver.conn_id,
            receiver.user_id,
            delivery_ack_envelope(msg_id, "delivered"),
        )
        .await
        .unwrap();

    let record = gateway
        .delivery
        .status(msg_id, receiver.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DeliveryStatus::Read);

    sender.drain();
}

#[tokio::test]
async fn relayed_messages_reach_subscribers_on_peer_processes() {
    // Two gateways sharing a store and relay channel behave like a fleet.
    let store = Arc::new(MemoryStore::new());
    let (tx, relay) = LoopbackRelay::channel();
    let relay: Arc<dyn RelayTransport> = relay;

    let gateway_a = build_gateway(
        Arc::clone(&store),
        Arc::new(MemoryStreamLog::new()),
        Arc::clone(&relay),
        GatewayOptions::default(),
    );
    let gateway_b = build_gateway(
        Arc::clone(&store),
        Arc::new(MemoryStreamLog::new()),
        relay,
        GatewayOptions::default(),
    );
    let _feed_a = attach_relay_feed(&tx, Arc::clone(&gateway_a.broadcast));
    let _feed_b = attach_relay_feed(&tx, Arc::clone(&gateway_b.broadcast));

    let room = Uuid::new_v4();
    let mut local = TestClient::connect(&gateway_a, &[room]).await;
    let mut remote = TestClient::connect(&gateway_b, &[room]).await;

    gateway_a
        .service
        .handle_envelope(local.conn_id, local.user_id, chat_envelope(room, "cross"))
        .await
        .unwrap();

    // Give the relay feed a beat to deliver.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let remote_frames = remote.drain();
    assert!(remote_frames
        .iter()
        .any(|f| matches!(f, OutboundFrame::Message { content, .. } if content == "cross")));

    // The originating process saw the message exactly once: its own relay
    // frame was discarded at the receiving edge.
    let local_copies = local
        .drain()
        .into_iter()
        .filter(|f| matches!(f, OutboundFrame::Message { content, .. } if content == "cross"))
        .count();
    assert_eq!(local_copies, 1);
}

struct ToxicModerator;

#[async_trait::async_trait]
impl chat_gateway::domain::moderation::Moderator for ToxicModerator {
    async fn scan(
        &self,
        _content: &str,
        _room_id: Uuid,
        _msg_id: Uuid,
        _user_id: Uuid,
    ) -> Result<chat_gateway::domain::moderation::ModerationVerdict, GatewayError> {
        Ok(chat_gateway::domain::moderation::ModerationVerdict {
            is_toxic: true,
            score: 0.93,
            suggestion: Some("maybe rephrase that".into()),
        })
    }
}

struct BrokenModerator;

#[async_trait::async_trait]
impl chat_gateway::domain::moderation::Moderator for BrokenModerator {
    async fn scan(
        &self,
        _content: &str,
        _room_id: Uuid,
        _msg_id: Uuid,
        _user_id: Uuid,
    ) -> Result<chat_gateway::domain::moderation::ModerationVerdict, GatewayError> {
        Err(GatewayError::Internal("moderation backend down".into()))
    }
}

#[tokio::test]
async fn toxic_content_warns_the_sender_but_still_delivers() {
    let gateway = single_gateway(GatewayOptions {
        moderator: Arc::new(ToxicModerator),
        ..GatewayOptions::default()
    });
    let room = Uuid::new_v4();
    let mut sender = TestClient::connect(&gateway, &[room]).await;
    let mut receiver = TestClient::connect(&gateway, &[room]).await;

    gateway
        .service
        .handle_envelope(sender.conn_id, sender.user_id, chat_envelope(room, "rude"))
        .await
        .unwrap();

    let frames = sender.drain();
    assert!(frames.iter().any(|f| matches!(
        f,
        OutboundFrame::ModerationWarning { score, suggestion, .. }
            if *score > 0.9 && suggestion.is_some()
    )));
    // Delivery was not blocked.
    assert!(matches!(
        receiver.next_frame(),
        Some(OutboundFrame::Message { .. })
    ));
}

#[tokio::test]
async fn moderation_failure_never_blocks_delivery() {
    let gateway = single_gateway(GatewayOptions {
        moderator: Arc::new(BrokenModerator),
        ..GatewayOptions::default()
    });
    let room = Uuid::new_v4();
    let sender = TestClient::connect(&gateway, &[room]).await;
    let mut receiver = TestClient::connect(&gateway, &[room]).await;

    gateway
        .service
        .handle_envelope(sender.conn_id, sender.user_id, chat_envelope(room, "hello"))
        .await
        .expect("moderation failure must not fail the message");
    assert!(matches!(
        receiver.next_frame(),
        Some(OutboundFrame::Message { .. })
    ));
}

#[tokio::test]
async fn closed_connection_receives_nothing_further() {
    let gateway = single_gateway(GatewayOptions::default());
    let room = Uuid::new_v4();
    let mut leaver = TestClient::connect(&gateway, &[room]).await;
    let sender = TestClient::connect(&gateway, &[room]).await;

    gateway.service.connection_close(leaver.conn_id).await;
    assert_eq!(gateway.registry.connection_count(), 1);

    gateway
        .service
        .handle_envelope(sender.conn_id, sender.user_id, chat_envelope(room, "bye"))
        .await
        .unwrap();
    assert!(leaver.next_frame().is_none());
}
