//! Cache Module
//!
//! Redis connection management and the coordination store abstraction.

mod store;

pub use store::{CoordinationStore, MemoryStore, RedisStore};

#[cfg(test)]
pub use store::MockCoordinationStore;

use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{info, instrument};

use crate::config::RedisSettings;

/// Creates a Redis connection manager with automatic reconnection.
///
/// The connection manager handles connection pooling and automatic
/// reconnection when the connection is lost.
#[instrument(skip(settings), fields(url = %settings.url))]
pub async fn create_redis_client(
    settings: &RedisSettings,
) -> Result<ConnectionManager, redis::RedisError> {
    info!("Connecting to Redis...");
    let client = Client::open(settings.url.as_str())?;
    let manager = ConnectionManager::new(client).await?;
    info!("Redis connection established");
    Ok(manager)
}

/// Shared-store key layout.
///
/// Use these helpers to keep key naming consistent across the gateway.
pub mod keys {
    use uuid::Uuid;

    /// Prefix for rate limit windows ("ratelimit:{user}:{room}")
    pub const RATE_LIMIT: &str = "ratelimit:";

    /// Prefix for distributed locks ("lock:{job}")
    pub const LOCK: &str = "lock:";

    /// Prefix for advisory room participant counters
    /// ("room:connections:{room_id}")
    pub const ROOM_CONNECTIONS: &str = "room:connections:";

    /// Prefix for per-room durable streams ("stream:room:{room_id}")
    pub const ROOM_STREAM: &str = "stream:room:";

    /// Cross-cutting archival stream
    pub const ARCHIVAL_STREAM: &str = "stream:archival";

    /// Cross-cutting moderation stream
    pub const MODERATION_STREAM: &str = "stream:moderation";

    /// Prefix for delivery acknowledgment hashes ("delivery:{msg_id}")
    pub const DELIVERY: &str = "delivery:";

    /// Generates a rate limit key for a (user, room) pair
    #[inline]
    pub fn rate_limit(user_id: Uuid, room_id: Uuid) -> String {
        format!("{}{}:{}", RATE_LIMIT, user_id, room_id)
    }

    /// Generates a distributed lock key
    #[inline]
    pub fn lock(job: &str) -> String {
        format!("{}{}", LOCK, job)
    }

    /// Generates a room participant counter key
    #[inline]
    pub fn room_connections(room_id: Uuid) -> String {
        format!("{}{}", ROOM_CONNECTIONS, room_id)
    }

    /// Generates a per-room stream key
    #[inline]
    pub fn room_stream(room_id: Uuid) -> String {
        format!("{}{}", ROOM_STREAM, room_id)
    }

    /// Generates a delivery record hash key
    #[inline]
    pub fn delivery(msg_id: Uuid) -> String {
        format!("{}{}", DELIVERY, msg_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn key_layout_matches_wire_contract() {
        let user = Uuid::nil();
        let room = Uuid::nil();
        assert_eq!(
            keys::rate_limit(user, room),
            format!("ratelimit:{}:{}", user, room)
        );
        assert_eq!(keys::lock("stream-trim"), "lock:stream-trim");
        assert_eq!(
            keys::room_connections(room),
            format!("room:connections:{}", room)
        );
        assert_eq!(keys::room_stream(room), format!("stream:room:{}", room));
    }
}
