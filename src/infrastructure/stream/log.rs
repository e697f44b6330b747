//! Durable Log Abstraction
//!
//! The operations the stream router needs from a durable append-only log
//! with consumer groups. Redis streams back the production
//! implementation; an in-memory implementation serves tests and
//! single-process runs.

use async_trait::async_trait;

use crate::shared::error::GatewayError;

/// One entry read back from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    /// Monotonically increasing entry id assigned at append time
    pub id: String,
    pub fields: Vec<(String, String)>,
}

/// Append-only log with named consumer groups.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Append an entry; the log assigns a monotonically increasing id.
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, GatewayError>;

    /// Idempotently create a consumer group covering the stream's full
    /// history. Creating an existing group is a no-op.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), GatewayError>;

    /// Entries previously delivered to this consumer but not yet
    /// acknowledged, oldest first.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamRecord>, GatewayError>;

    /// Entries the group has not seen yet; blocks up to `block_ms` when
    /// none are available (0 = no blocking). Delivered entries become
    /// pending until acknowledged.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamRecord>, GatewayError>;

    /// Acknowledge an entry for a group. Returns the number of entries
    /// removed from the group's pending state (0 or 1).
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, GatewayError>;

    /// Number of entries currently in the stream.
    async fn len(&self, stream: &str) -> Result<u64, GatewayError>;

    /// Trim to approximately `max_len` entries, dropping the oldest.
    /// Returns the number of evicted entries.
    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, GatewayError>;
}
