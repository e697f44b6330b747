//! Application Startup
//!
//! Application building and server initialization. Every gateway
//! component is constructed here and dependency-injected; nothing is a
//! language-level global.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::application::services::{GatewayService, MaintenanceService};
use crate::config::Settings;
use crate::domain::moderation::{DisabledModerator, Moderator};
use crate::infrastructure::breaker::CircuitBreaker;
use crate::infrastructure::cache::{self, CoordinationStore, RedisStore};
use crate::infrastructure::delivery::DeliveryTracker;
use crate::infrastructure::lock::DistributedLock;
use crate::infrastructure::rate_limit::RoomRateLimiter;
use crate::infrastructure::relay::RedisRelay;
use crate::infrastructure::stream::{RedisStreamLog, StreamRouter};
use crate::presentation::http::routes;
use crate::presentation::middleware::create_cors_layer;
use crate::presentation::websocket::{BroadcastEngine, ConnectionRegistry};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GatewayService>,
    pub settings: Arc<Settings>,
}

/// Application instance
pub struct Application {
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Build the application from settings
    pub async fn build(settings: Settings) -> Result<Self> {
        // Shared coordination store
        let redis_conn = cache::create_redis_client(&settings.redis).await?;
        let store: Arc<dyn CoordinationStore> = Arc::new(RedisStore::new(redis_conn.clone()));

        // One breaker per external dependency; state is process-local by
        // design.
        let store_breaker = Arc::new(CircuitBreaker::new("store", settings.breaker.clone()));
        let moderation_breaker =
            Arc::new(CircuitBreaker::new("moderation", settings.breaker.clone()));

        // Connection registry and broadcast engine
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = Arc::new(RedisRelay::new(
            redis_conn.clone(),
            settings.broadcast.relay_channel.clone(),
        ));
        let broadcast = Arc::new(BroadcastEngine::new(
            Arc::clone(&registry),
            relay,
            settings.broadcast.clone(),
        ));
        let _ = broadcast.spawn_flusher();
        spawn_relay_subscriber(&settings, Arc::clone(&broadcast))?;

        // Durable stream router
        let stream_log = Arc::new(RedisStreamLog::new(redis_conn.clone()));
        let stream_router = Arc::new(StreamRouter::new(stream_log));

        let limiter = RoomRateLimiter::new(
            Arc::clone(&store),
            Arc::clone(&store_breaker),
            settings.rate_limit.clone(),
        );
        let delivery = DeliveryTracker::new(Arc::clone(&store), Arc::clone(&store_breaker));
        let moderator: Arc<dyn Moderator> = Arc::new(DisabledModerator);

        let service = Arc::new(GatewayService::new(
            Arc::clone(&registry),
            Arc::clone(&broadcast),
            limiter,
            Arc::clone(&stream_router),
            delivery,
            moderator,
            moderation_breaker,
            Arc::clone(&store),
            settings.gateway.clone(),
        ));

        // Singleton background jobs plus the reaper safety net
        let maintenance = Arc::new(MaintenanceService::new(
            DistributedLock::new(Arc::clone(&store)),
            stream_router,
            Arc::clone(&registry),
            settings.maintenance.clone(),
            Duration::from_secs(settings.gateway.reaper_interval_secs),
        ));
        maintenance.spawn();

        // Create app state
        let state = AppState {
            service,
            settings: Arc::new(settings.clone()),
        };

        // Build router with middleware
        let router = routes::create_router(state)
            .layer(TraceLayer::new_for_http())
            .layer(create_cors_layer(&settings.cors));

        // Bind to address
        let addr = SocketAddr::from(([0, 0, 0, 0], settings.server.port));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Listening on {}", addr);

        Ok(Self { listener, router })
    }

    /// Run the server until stopped
    pub async fn run_until_stopped(self) -> Result<()> {
        axum::serve(self.listener, self.router).await?;
        Ok(())
    }

    /// Get the bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Subscribe to the relay channel on a dedicated pub/sub connection,
/// reconnecting with a short backoff when the subscription drops.
fn spawn_relay_subscriber(
    settings: &Settings,
    engine: Arc<BroadcastEngine>,
) -> Result<()> {
    let client = redis::Client::open(settings.redis.url.as_str())?;
    let channel = settings.broadcast.relay_channel.clone();
    let origin = engine.origin();

    tokio::spawn(async move {
        loop {
            let result = RedisRelay::run_subscriber(
                client.clone(),
                channel.clone(),
                origin,
                |frame| engine.handle_relay_frame(frame),
            )
            .await;
            if let Err(err) = result {
                tracing::error!(error = %err, "Relay subscriber failed, reconnecting");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
    Ok(())
}
