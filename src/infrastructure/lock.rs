//! Distributed Lock
//!
//! Mutual exclusion for singleton scheduled jobs across a horizontally
//! scaled fleet. Built on set-if-absent-with-expiry in the shared store;
//! the TTL bounds worst-case staleness if the holder crashes mid-task.
//! Acquisition fails closed: a store error counts as "not acquired",
//! because a missed scheduled run is safer than a duplicate one.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::infrastructure::cache::{keys, CoordinationStore};
use crate::infrastructure::metrics;
use crate::shared::error::GatewayError;

/// Named mutual-exclusion lock in the shared store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Try to acquire the named lock. Returns true on success; false when
    /// another holder owns it.
    pub async fn acquire(&self, name: &str, ttl_secs: u64) -> Result<bool, GatewayError> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .store
            .set_nx_ex(&keys::lock(name), &token, ttl_secs)
            .await?;
        debug!(lock = %name, acquired = acquired, ttl_secs = ttl_secs, "Lock acquire attempt");
        metrics::record_lock_attempt(name, acquired);
        Ok(acquired)
    }

    /// Release the named lock unconditionally.
    pub async fn release(&self, name: &str) -> Result<(), GatewayError> {
        self.store.delete(&keys::lock(name)).await?;
        debug!(lock = %name, "Lock released");
        Ok(())
    }

    /// Run `job` only if the lock can be acquired, releasing it afterwards
    /// regardless of the job's outcome.
    ///
    /// Returns `Ok(None)` when another instance holds the lock.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        ttl_secs: u64,
        job: F,
    ) -> Result<Option<T>, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        if !self.acquire(name, ttl_secs).await? {
            return Ok(None);
        }

        let outcome = job().await;

        // Guaranteed-cleanup path: release even when the job failed.
        if let Err(err) = self.release(name).await {
            warn!(lock = %name, error = %err, "Failed to release lock; TTL will reclaim it");
        }

        outcome.map(Some)
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock").finish_non_exhaustive()
    }
}
