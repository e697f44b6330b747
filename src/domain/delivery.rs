//! Delivery Status
//!
//! Per-(message, recipient) acknowledgment state. Transitions are
//! monotonic: `pending -> delivered -> read`, never backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery status for a single recipient of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Monotonic ordering rank; a transition is only applied when the new
    /// rank is strictly greater.
    pub fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }
}

/// Stored record for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn pending() -> Self {
        let now = Utc::now();
        Self {
            status: DeliveryStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an acknowledgment. Returns true when the record advanced;
    /// false for duplicate or regressing acks (both are no-ops).
    pub fn advance(&mut self, next: DeliveryStatus) -> bool {
        if next.rank() > self.status.rank() {
            self.status = next;
            self.updated_at = Utc::now();
            true
        } else {
            false
        }
    }
}
