//! Coordination Store
//!
//! The narrow interface every component uses to reach the shared
//! coordination store: counters with TTL, set-if-absent (locks), and
//! hashes (delivery records). Keeping the trait concrete and object-safe
//! lets tests substitute an in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, instrument};

use crate::shared::error::GatewayError;

/// Key/value operations against the shared coordination store.
///
/// All operations are async and return `Result<T, GatewayError>`; callers
/// decide per component whether a store failure fails open or closed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Increment a counter, creating it at 0 first if absent.
    async fn incr(&self, key: &str) -> Result<i64, GatewayError>;

    /// Decrement a counter, creating it at 0 first if absent.
    async fn decr(&self, key: &str) -> Result<i64, GatewayError>;

    /// Set an expiry on an existing key. Returns false if the key does not
    /// exist.
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, GatewayError>;

    /// Remaining TTL in seconds; `None` when the key is missing or has no
    /// expiry.
    async fn ttl(&self, key: &str) -> Result<Option<i64>, GatewayError>;

    /// Fetch a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;

    /// Store a string value with an expiry.
    async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<(), GatewayError>;

    /// Atomic set-if-absent with expiry; the distributed lock primitive.
    /// Returns true when the key was set (did not exist).
    async fn set_nx_ex(&self, key: &str, value: &str, seconds: u64)
        -> Result<bool, GatewayError>;

    /// Delete a key. Returns true when it existed.
    async fn delete(&self, key: &str) -> Result<bool, GatewayError>;

    /// Fetch one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, GatewayError>;

    /// Store one hash field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), GatewayError>;
}

/// Redis-backed store implementation.
///
/// Uses a Redis ConnectionManager for connection pooling and automatic
/// reconnection handling.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    #[instrument(skip(self), level = "debug")]
    async fn incr(&self, key: &str) -> Result<i64, GatewayError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await?;
        debug!(key = %key, value = value, "Store increment");
        Ok(value)
    }

    #[instrument(skip(self), level = "debug")]
    async fn decr(&self, key: &str) -> Result<i64, GatewayError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.decr(key, 1).await?;
        debug!(key = %key, value = value, "Store decrement");
        Ok(value)
    }

    #[instrument(skip(self), level = "debug")]
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, GatewayError> {
        let mut conn = self.conn.clone();
        // Redis EXPIRE returns 1 if the timeout was set, 0 if the key does
        // not exist
        let result: i32 = conn.expire(key, seconds as i64).await?;
        Ok(result == 1)
    }

    #[instrument(skip(self), level = "debug")]
    async fn ttl(&self, key: &str) -> Result<Option<i64>, GatewayError> {
        let mut conn = self.conn.clone();
        let ttl: i64 = conn.ttl(key).await?;
        // -2: key missing, -1: no expiry
        Ok(if ttl < 0 { None } else { Some(ttl) })
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, seconds).await?;
        Ok(())
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        seconds: u64,
    ) -> Result<bool, GatewayError> {
        let mut conn = self.conn.clone();
        // SET with NX and EX for atomic set-if-not-exists with expiry
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        let was_set = result.is_some();
        debug!(key = %key, ttl = seconds, was_set = was_set, "Store set NX with expiry");
        Ok(was_set)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<bool, GatewayError> {
        let mut conn = self.conn.clone();
        let deleted: u64 = conn.del(key).await?;
        Ok(deleted > 0)
    }

    #[instrument(skip(self), level = "debug")]
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, GatewayError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct MemoryValue {
    data: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    values: HashMap<String, MemoryValue>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl MemoryInner {
    fn expired(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(|v| v.expires_at)
            .is_some_and(|at| Instant::now() >= at)
    }

    fn evict_expired(&mut self, key: &str) {
        if self.expired(key) {
            self.values.remove(key);
        }
    }
}

/// In-memory store for tests and single-process deployments.
///
/// Not distributed: state is process-local and vanishes on restart.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn incr(&self, key: &str) -> Result<i64, GatewayError> {
        let mut inner = self.inner.lock();
        inner.evict_expired(key);
        let entry = inner.values.entry(key.to_string()).or_insert(MemoryValue {
            data: "0".into(),
            expires_at: None,
        });
        let value = entry.data.parse::<i64>().unwrap_or(0) + 1;
        entry.data = value.to_string();
        Ok(value)
    }

    async fn decr(&self, key: &str) -> Result<i64, GatewayError> {
        let mut inner = self.inner.lock();
        inner.evict_expired(key);
        let entry = inner.values.entry(key.to_string()).or_insert(MemoryValue {
            data: "0".into(),
            expires_at: None,
        });
        let value = entry.data.parse::<i64>().unwrap_or(0) - 1;
        entry.data = value.to_string();
        Ok(value)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, GatewayError> {
        let mut inner = self.inner.lock();
        inner.evict_expired(key);
        match inner.values.get_mut(key) {
            Some(value) => {
                value.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>, GatewayError> {
        let mut inner = self.inner.lock();
        inner.evict_expired(key);
        Ok(inner.values.get(key).and_then(|v| {
            v.expires_at
                .map(|at| at.saturating_duration_since(Instant::now()).as_secs() as i64)
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let mut inner = self.inner.lock();
        inner.evict_expired(key);
        Ok(inner.values.get(key).map(|v| v.data.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock();
        inner.values.insert(
            key.to_string(),
            MemoryValue {
                data: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(seconds)),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        seconds: u64,
    ) -> Result<bool, GatewayError> {
        let mut inner = self.inner.lock();
        inner.evict_expired(key);
        if inner.values.contains_key(key) {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            MemoryValue {
                data: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(seconds)),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, GatewayError> {
        let mut inner = self.inner.lock();
        inner.evict_expired(key);
        let existed = inner.values.remove(key).is_some() | inner.hashes.remove(key).is_some();
        Ok(existed)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, GatewayError> {
        let inner = self.inner.lock();
        Ok(inner
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }
}
