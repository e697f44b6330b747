//! Maintenance Service
//!
//! Scheduled background jobs that must run on exactly one instance of a
//! horizontally-scaled fleet at a time: stream retention trimming under
//! the distributed lock, plus the process-local connection reaper safety
//! net. All jobs run off the hot path.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MaintenanceSettings;
use crate::infrastructure::lock::DistributedLock;
use crate::infrastructure::stream::StreamRouter;
use crate::presentation::websocket::registry::ConnectionRegistry;

/// Lock name guarding the stream trim job across the fleet
pub const STREAM_TRIM_LOCK: &str = "stream-trim";

/// Background maintenance scheduler.
pub struct MaintenanceService {
    lock: DistributedLock,
    router: Arc<StreamRouter>,
    registry: Arc<ConnectionRegistry>,
    settings: MaintenanceSettings,
    reaper_interval: Duration,
}

impl MaintenanceService {
    pub fn new(
        lock: DistributedLock,
        router: Arc<StreamRouter>,
        registry: Arc<ConnectionRegistry>,
        settings: MaintenanceSettings,
        reaper_interval: Duration,
    ) -> Self {
        Self {
            lock,
            router,
            registry,
            settings,
            reaper_interval,
        }
    }

    /// Spawn the trim and reaper loops. The handles are detached; the
    /// tasks live as long as the process.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let trim = {
            let service = Arc::clone(&self);
            tokio::spawn(async move { service.run_trim_loop().await })
        };
        let reaper = {
            let service = Arc::clone(&self);
            tokio::spawn(async move { service.run_reaper_loop().await })
        };
        vec![trim, reaper]
    }

    async fn run_trim_loop(&self) {
        let base = Duration::from_secs(self.settings.trim_interval_secs.max(1));
        loop {
            // Jitter the interval so a fleet restarted together does not
            // contend for the lock on the same tick.
            let jitter_ms = rand::rng().random_range(0..=(base.as_millis() as u64 / 10).max(1));
            tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
            self.run_trim_once().await;
        }
    }

    /// One trim tick. Skips silently when another instance holds the
    /// lock; a store error also skips (fail closed) with an alert.
    pub async fn run_trim_once(&self) {
        let rooms = self.registry.room_ids();
        let max_len = self.settings.stream_max_len;
        let router = Arc::clone(&self.router);

        let result = self
            .lock
            .with_lock(STREAM_TRIM_LOCK, self.settings.lock_ttl_secs, || async move {
                router.trim_streams(&rooms, max_len).await
            })
            .await;

        match result {
            Ok(Some(evicted)) => {
                if evicted > 0 {
                    info!(evicted = evicted, "Stream trim pass completed");
                } else {
                    debug!("Stream trim pass completed, nothing to evict");
                }
            }
            Ok(None) => debug!("Stream trim lock held elsewhere, skipping"),
            Err(err) => warn!(error = %err, "Stream trim skipped"),
        }
    }

    async fn run_reaper_loop(&self) {
        let mut ticker = tokio::time::interval(self.reaper_interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = self.registry.reap();
            if !reaped.is_empty() {
                debug!(count = reaped.len(), "Reaper removed dead connections");
            }
        }
    }
}

impl std::fmt::Debug for MaintenanceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceService")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cache::{CoordinationStore, MemoryStore};
    use crate::infrastructure::stream::MemoryStreamLog;

    fn service(store: Arc<MemoryStore>, router: Arc<StreamRouter>) -> MaintenanceService {
        MaintenanceService::new(
            DistributedLock::new(store),
            router,
            Arc::new(ConnectionRegistry::new()),
            MaintenanceSettings {
                trim_interval_secs: 300,
                lock_ttl_secs: 60,
                stream_max_len: 2,
            },
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn trim_tick_runs_under_the_lock_and_releases_it() {
        let store = Arc::new(MemoryStore::new());
        let router = Arc::new(StreamRouter::new(Arc::new(MemoryStreamLog::new())));
        let service = service(Arc::clone(&store), router);

        service.run_trim_once().await;

        // The lock was released on the way out.
        let lock = DistributedLock::new(store);
        assert!(lock.acquire(STREAM_TRIM_LOCK, 60).await.unwrap());
    }

    #[tokio::test]
    async fn trim_tick_skips_when_lock_held_elsewhere() {
        let store = Arc::new(MemoryStore::new());
        let router = Arc::new(StreamRouter::new(Arc::new(MemoryStreamLog::new())));

        let holder = DistributedLock::new(Arc::clone(&store) as Arc<dyn CoordinationStore>);
        assert!(holder.acquire(STREAM_TRIM_LOCK, 60).await.unwrap());

        // Must not error and must not steal the lock.
        let service = service(Arc::clone(&store), router);
        service.run_trim_once().await;
        assert!(!holder.acquire(STREAM_TRIM_LOCK, 60).await.unwrap());
    }
}
