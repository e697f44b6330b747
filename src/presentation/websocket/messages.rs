//! WebSocket Message Types
//!
//! Wire formats for client <-> gateway communication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::delivery::DeliveryStatus;
use crate::domain::message::RoomMessage;
use crate::shared::error::{ErrorCode, GatewayError};

fn default_ack_status() -> DeliveryStatus {
    DeliveryStatus::Delivered
}

/// Message body; clients send either `content` or `text`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagePayload {
    pub content: Option<String>,
    pub text: Option<String>,
}

impl MessagePayload {
    pub fn body(&self) -> Option<&str> {
        self.content.as_deref().or(self.text.as_deref())
    }
}

/// Inbound client envelope.
///
/// Unknown `type` values fail deserialization and surface as
/// `message_processing_failed`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame after the socket opens; the auth collaborator has
    /// already verified the token upstream and the adapter forwards the
    /// subject id.
    Identify { user_id: String },

    ChatMessage {
        room_id: String,
        #[serde(default)]
        msg_id: Option<Uuid>,
        payload: MessagePayload,
        #[serde(default)]
        requires_ack: bool,
    },

    JoinRoom { room_id: String },

    LeaveRoom { room_id: String },

    DeliveryAck {
        msg_id: Uuid,
        #[serde(default = "default_ack_status")]
        status: DeliveryStatus,
    },
}

/// Outbound gateway frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Message {
        msg_id: Uuid,
        room_id: Uuid,
        user_id: Uuid,
        content: String,
        sent_at: DateTime<Utc>,
    },

    MsgAck {
        msg_id: Uuid,
        status: &'static str,
        published_at: DateTime<Utc>,
    },

    Error {
        msg: ErrorCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        remaining: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reset_at: Option<i64>,
    },

    ModerationWarning {
        msg_id: Uuid,
        score: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
    },

    DeliveryAckConfirmed {
        msg_id: Uuid,
        confirmed_at: DateTime<Utc>,
    },
}

impl OutboundFrame {
    pub fn message(msg: &RoomMessage) -> Self {
        OutboundFrame::Message {
            msg_id: msg.msg_id,
            room_id: msg.room_id,
            user_id: msg.user_id,
            content: msg.content.clone(),
            sent_at: msg.sent_at,
        }
    }

    pub fn ack(msg_id: Uuid) -> Self {
        OutboundFrame::MsgAck {
            msg_id,
            status: "published",
            published_at: Utc::now(),
        }
    }

    pub fn error(code: ErrorCode) -> Self {
        OutboundFrame::Error {
            msg: code,
            remaining: None,
            reset_at: None,
        }
    }

    /// Error frame for [`GatewayError`], carrying backoff hints when the
    /// rejection was a rate limit.
    pub fn from_error(err: &GatewayError) -> Self {
        match err {
            GatewayError::RateLimited {
                remaining, reset_at, ..
            } => OutboundFrame::Error {
                msg: ErrorCode::RateLimitExceeded,
                remaining: Some(*remaining),
                reset_at: Some(*reset_at),
            },
            other => OutboundFrame::error(other.client_code()),
        }
    }

    pub fn delivery_ack_confirmed(msg_id: Uuid) -> Self {
        OutboundFrame::DeliveryAckConfirmed {
            msg_id,
            confirmed_at: Utc::now(),
        }
    }
}

/// Parse a client-supplied room id; rejection carries `invalid_room_id`.
pub fn parse_room_id(raw: &str) -> Result<Uuid, GatewayError> {
    raw.parse()
        .map_err(|_| GatewayError::Validation(ErrorCode::InvalidRoomId))
}

/// Parse a client-supplied user id; rejection carries `invalid_user_id`.
pub fn parse_user_id(raw: &str) -> Result<Uuid, GatewayError> {
    raw.parse()
        .map_err(|_| GatewayError::Validation(ErrorCode::InvalidUserId))
}

/// Validate a message body against the configured size limit.
pub fn validate_body(payload: &MessagePayload, max_bytes: usize) -> Result<String, GatewayError> {
    let body = payload.body().unwrap_or("").trim();
    if body.is_empty() {
        return Err(GatewayError::Validation(ErrorCode::EmptyMessage));
    }
    if body.len() > max_bytes {
        return Err(GatewayError::Validation(ErrorCode::MessageTooLong));
    }
    Ok(body.to_string())
}
