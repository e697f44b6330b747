//! Message Rate Limiting
//!
//! Distributed fixed-window throttle per (user, room), backed by a
//! counter with TTL in the shared coordination store. The limiter fails
//! open: when the store is unreachable (or its circuit is open) it falls
//! back to a process-local window that is NOT distributed-consistent —
//! each instance then enforces the limit independently, so a fleet-wide
//! burst can briefly exceed the global limit.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RateLimitSettings;
use crate::infrastructure::breaker::CircuitBreaker;
use crate::infrastructure::cache::{keys, CoordinationStore};
use crate::infrastructure::metrics;
use crate::shared::error::GatewayError;

/// Rate limit decision returned to callers, surfaced to clients as
/// backoff hints.
#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix timestamp when the current window expires
    pub reset_at: i64,
}

#[derive(Debug)]
struct LocalWindow {
    count: u32,
    window_started_at: i64,
}

/// Per-(user, room) fixed-window message throttle.
pub struct RoomRateLimiter {
    store: Arc<dyn CoordinationStore>,
    breaker: Arc<CircuitBreaker>,
    settings: RateLimitSettings,
    /// Fail-open fallback windows, keyed like the store keys
    local: Mutex<HashMap<String, LocalWindow>>,
}

impl RoomRateLimiter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        breaker: Arc<CircuitBreaker>,
        settings: RateLimitSettings,
    ) -> Self {
        Self {
            store,
            breaker,
            settings,
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Check and consume one slot for this (user, room) pair.
    ///
    /// Returns `Ok` with the window state when allowed, or
    /// `Err(GatewayError::RateLimited)` when the window is exhausted.
    pub async fn check(&self, user_id: Uuid, room_id: Uuid) -> Result<RateDecision, GatewayError> {
        let key = keys::rate_limit(user_id, room_id);
        let limit = self.settings.max_messages;
        let window = self.settings.window_seconds;

        let store = Arc::clone(&self.store);
        let incr_key = key.clone();
        let count = self
            .breaker
            .call(move || async move { store.incr(&incr_key).await })
            .await;

        let count = match count {
            Ok(count) => count,
            Err(err) => {
                // Fail open: chat must not stall on shared-store trouble.
                warn!(
                    key = %key,
                    error = %GatewayError::from(err),
                    "Rate limit store unavailable, using local fallback window"
                );
                return self.check_local(&key, limit, window);
            }
        };

        // Only the first increment of a window sets the expiry; later
        // increments inherit it.
        if count == 1 {
            if let Err(err) = self.store.expire(&key, window).await {
                warn!(key = %key, error = %err, "Failed to set rate limit window expiry");
            }
        }

        let reset_at = self.window_reset_at(&key, window).await;

        if count > limit as i64 {
            // Put the counter back so the externally-visible count stays
            // accurate, then reject.
            if let Err(err) = self.store.decr(&key).await {
                warn!(key = %key, error = %err, "Failed to roll back rate limit counter");
            }
            metrics::record_rate_limited();
            debug!(user_id = %user_id, room_id = %room_id, "Rate limit exceeded");
            return Err(GatewayError::RateLimited {
                limit,
                remaining: 0,
                reset_at,
            });
        }

        Ok(RateDecision {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(count as u32),
            reset_at,
        })
    }

    async fn window_reset_at(&self, key: &str, window: u64) -> i64 {
        let now = chrono::Utc::now().timestamp();
        match self.store.ttl(key).await {
            Ok(Some(ttl)) => now + ttl,
            _ => now + window as i64,
        }
    }

    /// Process-local fallback. Not distributed-consistent: the window is
    /// enforced per instance only, which still bounds a flood through any
    /// single gateway.
    fn check_local(
        &self,
        key: &str,
        limit: u32,
        window: u64,
    ) -> Result<RateDecision, GatewayError> {
        let now = chrono::Utc::now().timestamp();
        let mut windows = self.local.lock();
        let entry = windows.entry(key.to_string()).or_insert(LocalWindow {
            count: 0,
            window_started_at: now,
        });

        if now - entry.window_started_at >= window as i64 {
            entry.count = 0;
            entry.window_started_at = now;
        }

        let reset_at = entry.window_started_at + window as i64;
        if entry.count >= limit {
            metrics::record_rate_limited();
            return Err(GatewayError::RateLimited {
                limit,
                remaining: 0,
                reset_at,
            });
        }

        entry.count += 1;
        Ok(RateDecision {
            allowed: true,
            limit,
            remaining: limit - entry.count,
            reset_at,
        })
    }
}

impl std::fmt::Debug for RoomRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRateLimiter")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerSettings;
    use crate::infrastructure::cache::{MemoryStore, MockCoordinationStore};

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "store",
            BreakerSettings {
                failure_threshold: 100,
                monitoring_window_secs: 60,
                open_timeout_secs: 30,
                success_threshold: 2,
            },
        ))
    }

    fn settings(limit: u32) -> RateLimitSettings {
        RateLimitSettings {
            max_messages: limit,
            window_seconds: 30,
        }
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_rejects() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RoomRateLimiter::new(store.clone(), breaker(), settings(3));
        let user = Uuid::new_v4();
        let room = Uuid::new_v4();

        for expected_remaining in [2u32, 1, 0] {
            let decision = limiter.check(user, room).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let err = limiter.check(user, room).await.unwrap_err();
        match err {
            GatewayError::RateLimited { reset_at, .. } => {
                assert!(reset_at > chrono::Utc::now().timestamp() - 1);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }

        // The rejected attempt was rolled back: the stored count still
        // reflects only accepted messages.
        let key = keys::rate_limit(user, room);
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn separate_keys_have_separate_windows() {
        let limiter = RoomRateLimiter::new(Arc::new(MemoryStore::new()), breaker(), settings(1));
        let user = Uuid::new_v4();

        assert!(limiter.check(user, Uuid::new_v4()).await.is_ok());
        assert!(limiter.check(user, Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn fails_open_into_local_window_on_store_errors() {
        let mut store = MockCoordinationStore::new();
        store.expect_incr().returning(|_| {
            Err(GatewayError::Internal("store unreachable".into()))
        });

        let limiter = RoomRateLimiter::new(Arc::new(store), breaker(), settings(2));
        let user = Uuid::new_v4();
        let room = Uuid::new_v4();

        // Messages are allowed despite the store being down...
        assert!(limiter.check(user, room).await.is_ok());
        assert!(limiter.check(user, room).await.is_ok());
        // ...but the local window still bounds a flood through this process.
        assert!(matches!(
            limiter.check(user, room).await,
            Err(GatewayError::RateLimited { .. })
        ));
    }
}
