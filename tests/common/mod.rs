//! Shared test harness
//!
//! Builds a full gateway stack over the in-memory store, stream log, and
//! a loopback relay, so pipeline tests run without external services.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use chat_gateway::application::services::GatewayService;
use chat_gateway::config::{
    BreakerSettings, BroadcastSettings, GatewaySettings, RateLimitSettings,
};
use chat_gateway::domain::moderation::{DisabledModerator, Moderator};
use chat_gateway::infrastructure::breaker::CircuitBreaker;
use chat_gateway::infrastructure::cache::{CoordinationStore, MemoryStore};
use chat_gateway::infrastructure::delivery::DeliveryTracker;
use chat_gateway::infrastructure::rate_limit::RoomRateLimiter;
use chat_gateway::infrastructure::relay::{RelayFrame, RelayTransport};
use chat_gateway::infrastructure::stream::{MemoryStreamLog, StreamRouter};
use chat_gateway::presentation::websocket::{
    BroadcastEngine, ConnectionRegistry, OutboundFrame,
};
use chat_gateway::shared::error::GatewayError;

/// Relay that loops frames back through a broadcast channel so several
/// in-process gateways behave like a fleet.
pub struct LoopbackRelay {
    tx: broadcast::Sender<RelayFrame>,
}

impl LoopbackRelay {
    pub fn channel() -> (broadcast::Sender<RelayFrame>, Arc<LoopbackRelay>) {
        let (tx, _) = broadcast::channel(256);
        (tx.clone(), Arc::new(LoopbackRelay { tx }))
    }
}

#[async_trait]
impl RelayTransport for LoopbackRelay {
    async fn publish(&self, frame: &RelayFrame) -> Result<(), GatewayError> {
        let _ = self.tx.send(frame.clone());
        Ok(())
    }
}

/// One in-process gateway instance.
pub struct TestGateway {
    pub service: Arc<GatewayService>,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcast: Arc<BroadcastEngine>,
    pub router: Arc<StreamRouter>,
    pub store: Arc<MemoryStore>,
    pub delivery: DeliveryTracker,
}

pub struct GatewayOptions {
    pub rate_limit: RateLimitSettings,
    pub max_room_connections: u32,
    pub batch_max_messages: usize,
    pub moderator: Arc<dyn Moderator>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitSettings {
                max_messages: 15,
                window_seconds: 30,
            },
            max_room_connections: 1000,
            // Flush relay batches on every publish so tests never wait for
            // the timer.
            batch_max_messages: 1,
            moderator: Arc::new(DisabledModerator),
        }
    }
}

fn breaker_settings() -> BreakerSettings {
    BreakerSettings {
        failure_threshold: 5,
        monitoring_window_secs: 60,
        open_timeout_secs: 30,
        success_threshold: 2,
    }
}

/// Build one gateway over shared backing pieces.
pub fn build_gateway(
    store: Arc<MemoryStore>,
    log: Arc<MemoryStreamLog>,
    relay: Arc<dyn RelayTransport>,
    options: GatewayOptions,
) -> TestGateway {
    let store_dyn: Arc<dyn CoordinationStore> = store.clone();
    let store_breaker = Arc::new(CircuitBreaker::new("store", breaker_settings()));
    let moderation_breaker = Arc::new(CircuitBreaker::new("moderation", breaker_settings()));

    let registry = Arc::new(ConnectionRegistry::new());
    let broadcast_engine = Arc::new(BroadcastEngine::new(
        Arc::clone(&registry),
        relay,
        BroadcastSettings {
            flush_interval_ms: 50,
            batch_max_messages: options.batch_max_messages,
            max_pending: 1000,
            relay_channel: "gateway:relay".into(),
        },
    ));
    let router = Arc::new(StreamRouter::new(log));
    let limiter = RoomRateLimiter::new(
        Arc::clone(&store_dyn),
        Arc::clone(&store_breaker),
        options.rate_limit,
    );
    let delivery = DeliveryTracker::new(Arc::clone(&store_dyn), Arc::clone(&store_breaker));

    let service = Arc::new(GatewayService::new(
        Arc::clone(&registry),
        Arc::clone(&broadcast_engine),
        limiter,
        Arc::clone(&router),
        DeliveryTracker::new(Arc::clone(&store_dyn), Arc::clone(&store_breaker)),
        options.moderator,
        moderation_breaker,
        Arc::clone(&store_dyn),
        GatewaySettings {
            max_message_bytes: 4096,
            max_room_connections: options.max_room_connections,
            identify_timeout_secs: 30,
            reaper_interval_secs: 30,
            room_counter_ttl_secs: 3600,
        },
    ));

    TestGateway {
        service,
        registry,
        broadcast: broadcast_engine,
        router,
        store,
        delivery,
    }
}

/// Wire a gateway's broadcast engine to the loopback relay feed.
pub fn attach_relay_feed(
    tx: &broadcast::Sender<RelayFrame>,
    engine: Arc<BroadcastEngine>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = tx.subscribe();
    tokio::spawn(async move {
        while let Ok(frame) = rx.recv().await {
            engine.handle_relay_frame(frame);
        }
    })
}

/// A client connected through the service: open + identify + joined rooms.
pub struct TestClient {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub rx: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl TestClient {
    /// Open, identify, and join the given rooms via the public envelope
    /// path.
    pub async fn connect(gateway: &TestGateway, rooms: &[Uuid]) -> Self {
        let conn_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        assert!(gateway.service.connection_open(conn_id, tx));
        gateway
            .service
            .identify(conn_id, &user_id.to_string())
            .expect("identify should succeed");
        for room in rooms {
            gateway
                .service
                .handle_envelope(conn_id, user_id, join_envelope(*room))
                .await
                .expect("join should succeed");
        }

        Self {
            conn_id,
            user_id,
            rx,
        }
    }

    /// Pop the next frame, if any arrived.
    pub fn next_frame(&mut self) -> Option<OutboundFrame> {
        self.rx.try_recv().ok()
    }

    /// Drain all frames received so far.
    pub fn drain(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

pub fn join_envelope(room: Uuid) -> chat_gateway::presentation::websocket::Envelope {
    serde_json::from_value(serde_json::json!({
        "type": "join_room",
        "room_id": room.to_string(),
    }))
    .expect("valid join envelope")
}

pub fn chat_envelope(room: Uuid, body: &str) -> chat_gateway::presentation::websocket::Envelope {
    serde_json::from_value(serde_json::json!({
        "type": "chat_message",
        "room_id": room.to_string(),
        "payload": { "content": body },
    }))
    .expect("valid chat envelope")
}

pub fn chat_envelope_with_ack(
    room: Uuid,
    body: &str,
) -> chat_gateway::presentation::websocket::Envelope {
    serde_json::from_value(serde_json::json!({
        "type": "chat_message",
        "room_id": room.to_string(),
        "payload": { "content": body },
        "requires_ack": true,
    }))
    .expect("valid chat envelope")
}

pub fn delivery_ack_envelope(
    msg_id: Uuid,
    status: &str,
) -> chat_gateway::presentation::websocket::Envelope {
    serde_json::from_value(serde_json::json!({
        "type": "delivery_ack",
        "msg_id": msg_id.to_string(),
        "status": status,
    }))
    .expect("valid delivery_ack envelope")
}
