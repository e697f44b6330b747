//! In-Memory Stream Log
//!
//! Non-durable [`StreamLog`] implementation for tests and single-process
//! deployments. Mirrors the consumer-group semantics of the Redis
//! implementation: per-group cursors, pending-entry state, and blocking
//! reads.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Duration, Instant};

use super::log::{StreamLog, StreamRecord};
use crate::shared::error::GatewayError;

#[derive(Debug, Default)]
struct GroupState {
    /// Highest sequence delivered to this group
    last_delivered: u64,
    /// Delivered but not yet acknowledged, per consumer
    pending: HashMap<String, BTreeSet<u64>>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<u64, Vec<(String, String)>>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

/// Process-local stream log.
#[derive(Debug, Default)]
pub struct MemoryStreamLog {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Arc<Notify>,
}

impl MemoryStreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(seq: u64, fields: &[(String, String)]) -> StreamRecord {
        StreamRecord {
            id: format!("{}-0", seq),
            fields: fields.to_vec(),
        }
    }

    fn parse_id(id: &str) -> Option<u64> {
        id.split('-').next()?.parse().ok()
    }
}

#[async_trait]
impl StreamLog for MemoryStreamLog {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, GatewayError> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.entries.insert(seq, fields.to_vec());
        drop(streams);

        self.appended.notify_waiters();
        Ok(format!("{}-0", seq))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), GatewayError> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamRecord>, GatewayError> {
        let streams = self.streams.lock().await;
        let Some(state) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get(group) else {
            return Ok(Vec::new());
        };
        let Some(pending) = group_state.pending.get(consumer) else {
            return Ok(Vec::new());
        };

        Ok(pending
            .iter()
            .filter_map(|seq| {
                state
                    .entries
                    .get(seq)
                    .map(|fields| Self::record(*seq, fields))
            })
            .take(count)
            .collect())
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamRecord>, GatewayError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);

        loop {
            // Register interest before checking so an append between the
            // check and the wait cannot be missed.
            let notified = self.appended.notified();

            {
                let mut streams = self.streams.lock().await;
                let state = streams.entry(stream.to_string()).or_default();
                let group_state = state
                    .groups
                    .entry(group.to_string())
                    .or_default();

                let batch: Vec<(u64, Vec<(String, String)>)> = state
                    .entries
                    .range((group_state.last_delivered + 1)..)
                    .take(count)
                    .map(|(seq, fields)| (*seq, fields.clone()))
                    .collect();

                if !batch.is_empty() {
                    let consumer_pending =
                        group_state.pending.entry(consumer.to_string()).or_default();
                    for (seq, _) in &batch {
                        consumer_pending.insert(*seq);
                        group_state.last_delivered = (*seq).max(group_state.last_delivered);
                    }
                    return Ok(batch
                        .iter()
                        .map(|(seq, fields)| Self::record(*seq, fields))
                        .collect());
                }
            }

            if block_ms == 0 || Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = notified => {}
                _ = sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, GatewayError> {
        let Some(seq) = Self::parse_id(id) else {
            return Ok(0);
        };
        let mut streams = self.streams.lock().await;
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(0);
        };
        let removed = group_state
            .pending
            .values_mut()
            .any(|pending| pending.remove(&seq));
        Ok(u64::from(removed))
    }

    async fn len(&self, stream: &str) -> Result<u64, GatewayError> {
        let streams = self.streams.lock().await;
        Ok(streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64, GatewayError> {
        let mut streams = self.streams.lock().await;
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };

        let mut evicted = 0;
        while state.entries.len() as u64 > max_len {
            let Some((&oldest, _)) = state.entries.iter().next() else {
                break;
            };
            state.entries.remove(&oldest);
            for group in state.groups.values_mut() {
                for pending in group.pending.values_mut() {
                    pending.remove(&oldest);
                }
            }
            evicted += 1;
        }
        Ok(evicted)
    }
}
