//! Redis Streams Implementation
//!
//! Maps the [`StreamLog`] operations onto XADD / XGROUP / XREADGROUP /
//! XACK / XLEN / XTRIM.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::instrument;

use super::log::{StreamLog, StreamRecord};
use crate::shared::error::GatewayError;

/// Redis-streams-backed durable log.
#[derive(Clone)]
pub struct RedisStreamLog {
    conn: ConnectionManager,
}

impl RedisStreamLog {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn records_from_reply(reply: StreamReadReply) -> Vec<StreamRecord> {
        reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| {
                let fields = entry
                    .map
                    .iter()
                    .filter_map(|(field, value)| {
                        redis::from_redis_value::<String>(value.clone())
                            .ok()
                            .map(|v| (field.clone(), v))
                    })
                    .collect();
                StreamRecord {
                    id: entry.id,
                    fields,
                }
            })
            .collect()
    }
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    #[instrument(skip(self, fields), level = "debug")]
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, GatewayError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    #[instrument(skip(self), level = "debug")]
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        // Start the group at "0" so it covers the stream's full history;
        // MKSTREAM creates the stream when it does not exist yet.
        let result: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match result {
            Ok(()) => Ok(()),
            // The group already exists; creation is idempotent.
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamRecord>, GatewayError> {
        let mut conn = self.conn.clone();
        // Reading from "0" re-delivers this consumer's pending entries.
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        let reply: StreamReadReply = conn.xread_options(&[stream], &["0"], &options).await?;
        Ok(Self::records_from_reply(reply))
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamRecord>, GatewayError> {
        let mut conn = self.conn.clone();
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if block_ms > 0 {
            options = options.block(block_ms as usize);
        }
        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &options).await?;
        Ok(Self::records_from_reply(reply))
    }

    #[instrument(skip(self), level = "debug")]
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, GatewayError> {
        let mut conn = self.conn.clone();
        let acked: u64 = conn.xack(stream, group, &[id]).await?;
        Ok(acked)
    }

    #[instrument(skip(self), level = "debug")]
    async fn len(&self, stream: &str) -> Result<u64, GatewayError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(stream).await?;
        Ok(len)
    }

    #[instrument(skip(self), level = "debug")]
    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, GatewayError> {
        let mut conn = self.conn.clone();
        let evicted: u64 = conn
            .xtrim(stream, StreamMaxlen::Approx(max_len as usize))
            .await?;
        Ok(evicted)
    }
}

impl std::fmt::Debug for RedisStreamLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamLog").finish_non_exhaustive()
    }
}
