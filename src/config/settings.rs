//! Application settings and configuration structures.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Root configuration structure containing all application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Server configuration (host, port)
    pub server: ServerSettings,

    /// Redis configuration (shared coordination store)
    pub redis: RedisSettings,

    /// Gateway limits and timeouts
    pub gateway: GatewaySettings,

    /// Per-(user, room) message throttle
    pub rate_limit: RateLimitSettings,

    /// Broadcast batching and backpressure
    pub broadcast: BroadcastSettings,

    /// Circuit breaker thresholds
    pub breaker: BreakerSettings,

    /// Distributed lock and scheduled maintenance
    pub maintenance: MaintenanceSettings,

    /// CORS configuration
    pub cors: CorsSettings,

    /// Current environment (development, staging, production)
    pub environment: String,
}

/// Server binding configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Host address to bind to (e.g., "0.0.0.0")
    pub host: String,

    /// Port number to listen on
    pub port: u16,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    /// Redis connection URL
    pub url: String,
}

/// Gateway limits applied per connection and per room.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    /// Maximum accepted message body size in bytes.
    /// Protects against DoS via oversized messages.
    pub max_message_bytes: usize,

    /// Maximum participants per room, enforced through the advisory
    /// cross-process counter. Slight overshoot under races is accepted.
    pub max_room_connections: u32,

    /// How long a client may stay connected without identifying, in seconds
    pub identify_timeout_secs: u64,

    /// Interval of the connection reaper safety net, in seconds
    pub reaper_interval_secs: u64,

    /// TTL on the advisory room participant counter, in seconds
    pub room_counter_ttl_secs: u64,
}

/// Rate limiting configuration for the per-(user, room) window.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Messages allowed per window
    pub max_messages: u32,

    /// Window duration in seconds
    pub window_seconds: u64,
}

/// Broadcast batching configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastSettings {
    /// Relay batch flush interval in milliseconds
    pub flush_interval_ms: u64,

    /// Flush a room's batch early once this many messages accumulate
    pub batch_max_messages: usize,

    /// Maximum unsent entries a room batch may hold before the oldest
    /// entries are dropped (explicit backpressure)
    pub max_pending: usize,

    /// Pub/sub channel used for the cross-process relay
    pub relay_channel: String,
}

/// Circuit breaker configuration, shared by all breaker instances.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    /// Failures within the monitoring window before the circuit opens
    pub failure_threshold: usize,

    /// Rolling monitoring window in seconds; older failures age out
    pub monitoring_window_secs: u64,

    /// How long an open circuit waits before allowing a probe, in seconds
    pub open_timeout_secs: u64,

    /// Consecutive half-open probe successes required to close
    pub success_threshold: u32,
}

/// Scheduled maintenance configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceSettings {
    /// Stream trim job interval in seconds
    pub trim_interval_secs: u64,

    /// Distributed lock TTL in seconds; bounds worst-case staleness if a
    /// holder crashes mid-task
    pub lock_ttl_secs: u64,

    /// Approximate maximum entries retained per stream
    pub stream_max_len: u64,
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsSettings {
    /// Allowed origins (comma-separated in env)
    pub allowed_origins: Vec<String>,
}

impl Settings {
    /// Load settings from environment variables and configuration files.
    ///
    /// The loading order is:
    /// 1. config/default.toml (base configuration)
    /// 2. config/{RUN_ENV}.toml (environment-specific overrides)
    /// 3. Environment variables (highest priority)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        // Determine the running environment
        let environment = std::env::var("RUN_ENV").unwrap_or_else(|_| "development".into());

        Config::builder()
            // Start with default values
            .set_default("environment", environment.clone())?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("gateway.max_message_bytes", 4096_i64)?
            .set_default("gateway.max_room_connections", 1000_i64)?
            .set_default("gateway.identify_timeout_secs", 30_i64)?
            .set_default("gateway.reaper_interval_secs", 30_i64)?
            .set_default("gateway.room_counter_ttl_secs", 3600_i64)?
            .set_default("rate_limit.max_messages", 15_i64)?
            .set_default("rate_limit.window_seconds", 30_i64)?
            .set_default("broadcast.flush_interval_ms", 50_i64)?
            .set_default("broadcast.batch_max_messages", 10_i64)?
            .set_default("broadcast.max_pending", 1000_i64)?
            .set_default("broadcast.relay_channel", "gateway:relay")?
            .set_default("breaker.failure_threshold", 5_i64)?
            .set_default("breaker.monitoring_window_secs", 60_i64)?
            .set_default("breaker.open_timeout_secs", 30_i64)?
            .set_default("breaker.success_threshold", 2_i64)?
            .set_default("maintenance.trim_interval_secs", 300_i64)?
            .set_default("maintenance.lock_ttl_secs", 60_i64)?
            .set_default("maintenance.stream_max_len", 10000_i64)?
            .set_default("cors.allowed_origins", vec!["http://localhost:3000"])?
            // Load from config files
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Load from environment variables
            // APP__SERVER__PORT=3000 -> server.port = 3000
            .add_source(
                Environment::default()
                    .prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            // Map simple environment variables
            .set_override_option("server.host", std::env::var("SERVER_HOST").ok())?
            .set_override_option("server.port", std::env::var("SERVER_PORT").ok())?
            .set_override_option("redis.url", std::env::var("REDIS_URL").ok())?
            .build()?
            .try_deserialize()
    }

    /// Get the full server address as a string.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ServerSettings {
    /// Get the socket address for binding.
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid server address configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_config_files() {
        let settings = Settings::load().expect("defaults should satisfy every field");
        assert_eq!(settings.rate_limit.max_messages, 15);
        assert_eq!(settings.broadcast.flush_interval_ms, 50);
        assert_eq!(settings.breaker.success_threshold, 2);
        assert!(settings.gateway.max_room_connections > 0);
    }
}
