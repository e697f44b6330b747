//! Delivery Acknowledgment Tracking
//!
//! Records pending/delivered/read status per (message, recipient) in the
//! shared store. This layer only records status; deciding what to do with
//! stale `pending` records is a higher-level concern. Writes fail closed:
//! a store error surfaces to the caller instead of silently dropping the
//! record.

use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::delivery::{DeliveryRecord, DeliveryStatus};
use crate::infrastructure::breaker::CircuitBreaker;
use crate::infrastructure::cache::{keys, CoordinationStore};
use crate::shared::error::GatewayError;

/// Outcome of applying one acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The record advanced to the new status
    Updated,
    /// Duplicate or regressing ack; nothing changed
    NoOp,
}

/// Per-(message, recipient) delivery status tracker.
pub struct DeliveryTracker {
    store: Arc<dyn CoordinationStore>,
    breaker: Arc<CircuitBreaker>,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn CoordinationStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { store, breaker }
    }

    /// Create pending records for the recipients this process delivered
    /// to. Each gateway records its own local recipients, which composes
    /// across the fleet.
    #[instrument(skip(self, recipients), fields(msg_id = %msg_id, count = recipients.len()))]
    pub async fn mark_pending(
        &self,
        msg_id: Uuid,
        recipients: &[Uuid],
    ) -> Result<(), GatewayError> {
        let key = keys::delivery(msg_id);
        let record = serde_json::to_string(&DeliveryRecord::pending())?;

        for recipient in recipients {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            let field = recipient.to_string();
            let value = record.clone();
            self.breaker
                .call(move || async move { store.hset(&key, &field, &value).await })
                .await
                .map_err(GatewayError::from)?;
        }
        Ok(())
    }

    /// Apply one recipient's acknowledgment. Monotonic and idempotent:
    /// duplicate acks and regressions are no-ops.
    #[instrument(skip(self), fields(msg_id = %msg_id, recipient = %recipient))]
    pub async fn ack(
        &self,
        msg_id: Uuid,
        recipient: Uuid,
        status: DeliveryStatus,
    ) -> Result<AckOutcome, GatewayError> {
        let key = keys::delivery(msg_id);
        let field = recipient.to_string();

        let store = Arc::clone(&self.store);
        let read_key = key.clone();
        let read_field = field.clone();
        let existing = self
            .breaker
            .call(move || async move { store.hget(&read_key, &read_field).await })
            .await
            .map_err(GatewayError::from)?;

        let mut record = match existing {
            Some(raw) => serde_json::from_str::<DeliveryRecord>(&raw)?,
            // Ack raced ahead of the pending write (or came from another
            // process); start from pending so the transition stays valid.
            None => DeliveryRecord::pending(),
        };

        if !record.advance(status) {
            debug!(status = status.as_str(), "Duplicate or regressing ack ignored");
            return Ok(AckOutcome::NoOp);
        }

        let value = serde_json::to_string(&record)?;
        let store = Arc::clone(&self.store);
        self.breaker
            .call(move || async move { store.hset(&key, &field, &value).await })
            .await
            .map_err(GatewayError::from)?;
        Ok(AckOutcome::Updated)
    }

    /// Current status for one recipient, if any record exists.
    pub async fn status(
        &self,
        msg_id: Uuid,
        recipient: Uuid,
    ) -> Result<Option<DeliveryRecord>, GatewayError> {
        let raw = self
            .store
            .hget(&keys::delivery(msg_id), &recipient.to_string())
            .await?;
        raw.map(|r| serde_json::from_str(&r).map_err(GatewayError::from))
            .transpose()
    }
}

impl std::fmt::Debug for DeliveryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTracker").finish_non_exhaustive()
    }
}
