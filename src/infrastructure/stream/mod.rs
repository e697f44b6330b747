//! Stream Router
//!
//! Durable append-only logs with independently-progressing consumer
//! groups. Each room owns a stream; two cross-cutting streams feed the
//! archival and moderation pipelines. A slow or absent consumer group
//! never blocks the others.

mod log;
mod memory;
mod redis_log;

pub use log::{StreamLog, StreamRecord};
pub use memory::MemoryStreamLog;
pub use redis_log::RedisStreamLog;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::domain::message::RoomMessage;
use crate::infrastructure::cache::keys;
use crate::shared::error::GatewayError;

/// Consumer group re-delivering entries to live gateway processes
pub const GROUP_BROADCAST: &str = "broadcast";
/// Consumer group feeding the archival pipeline
pub const GROUP_ARCHIVAL: &str = "archival";
/// Consumer group feeding the moderation pipeline
pub const GROUP_MODERATION: &str = "moderation";

/// Every stream carries all three groups so each pipeline keeps its own
/// cursor and pending state.
pub const CONSUMER_GROUPS: [&str; 3] = [GROUP_BROADCAST, GROUP_ARCHIVAL, GROUP_MODERATION];

/// Routes messages into durable logs and reads them back per group.
pub struct StreamRouter {
    log: Arc<dyn StreamLog>,
    /// Streams whose consumer groups were already ensured by this process
    ensured: Mutex<HashSet<String>>,
}

impl StreamRouter {
    pub fn new(log: Arc<dyn StreamLog>) -> Self {
        Self {
            log,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    /// Idempotently create the three consumer groups on a stream. Cached
    /// per process so the hot path pays the round-trips once per stream.
    async fn ensure_stream(&self, stream: &str) -> Result<(), GatewayError> {
        if self.ensured.lock().contains(stream) {
            return Ok(());
        }
        for group in CONSUMER_GROUPS {
            self.log.ensure_group(stream, group).await?;
        }
        self.ensured.lock().insert(stream.to_string());
        Ok(())
    }

    /// Durably append a message to its room stream and both cross-cutting
    /// streams. Returns the entry id in the room stream.
    #[instrument(skip(self, msg), fields(msg_id = %msg.msg_id, room_id = %msg.room_id))]
    pub async fn route(&self, msg: &RoomMessage) -> Result<String, GatewayError> {
        let fields = msg.to_fields();
        let room_stream = keys::room_stream(msg.room_id);

        self.ensure_stream(&room_stream).await?;
        self.ensure_stream(keys::ARCHIVAL_STREAM).await?;
        self.ensure_stream(keys::MODERATION_STREAM).await?;

        let id = self.log.append(&room_stream, &fields).await?;
        self.log.append(keys::ARCHIVAL_STREAM, &fields).await?;
        self.log.append(keys::MODERATION_STREAM, &fields).await?;
        Ok(id)
    }

    /// Read the next batch for a consumer group.
    ///
    /// Entries this consumer received earlier but never acknowledged are
    /// re-delivered first (crash recovery); only then does the call
    /// block-wait for new entries.
    pub async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, RoomMessage)>, GatewayError> {
        self.ensure_stream(stream).await?;

        let pending = self.log.read_pending(stream, group, consumer, count).await?;
        let records = if pending.is_empty() {
            self.log
                .read_new(stream, group, consumer, count, block_ms)
                .await?
        } else {
            pending
        };

        Ok(records
            .into_iter()
            .filter_map(|record| match Self::decode(&record) {
                Ok(msg) => Some((record.id, msg)),
                Err(err) => {
                    warn!(stream = %stream, id = %record.id, error = %err, "Skipping undecodable stream entry");
                    None
                }
            })
            .collect())
    }

    /// Acknowledge one entry for a consumer group.
    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, GatewayError> {
        self.log.ack(stream, group, id).await
    }

    /// Number of entries currently retained in a stream.
    pub async fn len(&self, stream: &str) -> Result<u64, GatewayError> {
        self.log.len(stream).await
    }

    /// Trim a stream to approximately `max_len` entries, dropping the
    /// oldest. Returns the number of evicted entries.
    pub async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, GatewayError> {
        self.log.trim(stream, max_len).await
    }

    /// Retention pass over the cross-cutting streams plus the given room
    /// streams. Returns total evicted entries.
    pub async fn trim_streams(
        &self,
        rooms: &[Uuid],
        max_len: u64,
    ) -> Result<u64, GatewayError> {
        let mut evicted = self.trim(keys::ARCHIVAL_STREAM, max_len).await?;
        evicted += self.trim(keys::MODERATION_STREAM, max_len).await?;
        for room in rooms {
            evicted += self.trim(&keys::room_stream(*room), max_len).await?;
        }
        Ok(evicted)
    }

    fn decode(record: &StreamRecord) -> Result<RoomMessage, GatewayError> {
        RoomMessage::from_fields(
            record
                .fields
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
    }
}

impl std::fmt::Debug for StreamRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRouter").finish_non_exhaustive()
    }
}
