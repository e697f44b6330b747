//! Application Error Types
//!
//! Centralized error handling for the gateway core.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Client-facing error codes carried in `{type:"error", msg:<code>}` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidUserId,
    InvalidRoomId,
    EmptyMessage,
    MessageTooLong,
    RateLimitExceeded,
    RoomFull,
    MessageProcessingFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidUserId => "invalid_user_id",
            ErrorCode::InvalidRoomId => "invalid_room_id",
            ErrorCode::EmptyMessage => "empty_message",
            ErrorCode::MessageTooLong => "message_too_long",
            ErrorCode::RateLimitExceeded => "rate_limit_exceeded",
            ErrorCode::RoomFull => "room_full",
            ErrorCode::MessageProcessingFailed => "message_processing_failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway error type
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("validation failed: {0}")]
    Validation(ErrorCode),

    #[error("rate limit exceeded, resets at {reset_at}")]
    RateLimited {
        limit: u32,
        remaining: u32,
        reset_at: i64,
    },

    #[error("room at capacity")]
    RoomFull,

    #[error("circuit '{dependency}' is open, retry in {retry_in:?}")]
    CircuitOpen {
        dependency: String,
        retry_in: Duration,
    },

    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Map to the code reported to the client. Anything a client cannot act
    /// on collapses into `message_processing_failed`.
    pub fn client_code(&self) -> ErrorCode {
        match self {
            GatewayError::Validation(code) => *code,
            GatewayError::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            GatewayError::RoomFull => ErrorCode::RoomFull,
            GatewayError::CircuitOpen { .. }
            | GatewayError::Store(_)
            | GatewayError::Serde(_)
            | GatewayError::Internal(_) => ErrorCode::MessageProcessingFailed,
        }
    }
}
