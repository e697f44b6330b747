//! Moderation Collaborator Seam
//!
//! The gateway invokes content scanning synchronously in the message path,
//! but a scan failure never blocks delivery; errors are logged only. The
//! scoring algorithm itself lives outside this crate.

use async_trait::async_trait;
use uuid::Uuid;

use crate::shared::error::GatewayError;

/// Result of scanning one message body.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationVerdict {
    pub is_toxic: bool,
    pub score: f64,
    pub suggestion: Option<String>,
}

impl ModerationVerdict {
    pub fn clean() -> Self {
        Self {
            is_toxic: false,
            score: 0.0,
            suggestion: None,
        }
    }
}

/// External content moderation collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Moderator: Send + Sync {
    async fn scan(
        &self,
        content: &str,
        room_id: Uuid,
        msg_id: Uuid,
        user_id: Uuid,
    ) -> Result<ModerationVerdict, GatewayError>;
}

/// Default wiring when no moderation backend is configured; every message
/// passes.
#[derive(Debug, Default)]
pub struct DisabledModerator;

#[async_trait]
impl Moderator for DisabledModerator {
    async fn scan(
        &self,
        _content: &str,
        _room_id: Uuid,
        _msg_id: Uuid,
        _user_id: Uuid,
    ) -> Result<ModerationVerdict, GatewayError> {
        Ok(ModerationVerdict::clean())
    }
}
