//! Cross-Process Relay
//!
//! Carries room message batches between gateway processes over the shared
//! store's pub/sub channel. Every published batch is tagged with the
//! origin process id; the receiving edge discards its own frames, so the
//! dual local-direct + relay path can never double-deliver on the
//! originating process.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::message::RoomMessage;
use crate::shared::error::GatewayError;

/// A batch of messages for one room, relayed to peer processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFrame {
    /// Id of the publishing gateway process
    pub origin: Uuid,
    pub room_id: Uuid,
    pub messages: Vec<RoomMessage>,
}

/// Outbound half of the relay.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn publish(&self, frame: &RelayFrame) -> Result<(), GatewayError>;
}

/// Redis pub/sub relay publisher.
#[derive(Clone)]
pub struct RedisRelay {
    conn: ConnectionManager,
    channel: String,
}

impl RedisRelay {
    pub fn new(conn: ConnectionManager, channel: impl Into<String>) -> Self {
        Self {
            conn,
            channel: channel.into(),
        }
    }

    /// Subscribe to the relay channel and hand every foreign frame to
    /// `on_frame`. Runs until the pub/sub connection closes.
    pub async fn run_subscriber<F>(
        client: redis::Client,
        channel: String,
        origin: Uuid,
        mut on_frame: F,
    ) -> Result<(), GatewayError>
    where
        F: FnMut(RelayFrame) + Send,
    {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        debug!(channel = %channel, "Relay subscriber started");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "Relay payload was not a string; skipping");
                    continue;
                }
            };
            match serde_json::from_str::<RelayFrame>(&payload) {
                Ok(frame) => {
                    // Own frames were already delivered locally.
                    if frame.origin == origin {
                        continue;
                    }
                    on_frame(frame);
                }
                Err(err) => {
                    warn!(error = %err, "Undecodable relay frame; skipping");
                }
            }
        }

        error!(channel = %channel, "Relay subscription closed");
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for RedisRelay {
    async fn publish(&self, frame: &RelayFrame) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(frame)?;
        let mut conn = self.conn.clone();
        let _: () = conn.publish(&self.channel, payload).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRelay")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Relay that drops every frame. For tests and single-process runs where
/// no peers exist.
#[derive(Debug, Default)]
pub struct NullRelay;

#[async_trait]
impl RelayTransport for NullRelay {
    async fn publish(&self, _frame: &RelayFrame) -> Result<(), GatewayError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_frame_round_trips_through_json() {
        let frame = RelayFrame {
            origin: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            messages: vec![RoomMessage::new(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "hi".into(),
                false,
            )],
        };
        let json = serde_json::to_string(&frame).unwrap();
        let decoded: RelayFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.origin, frame.origin);
        assert_eq!(decoded.messages.len(), 1);
        assert_eq!(decoded.messages[0].content, "hi");
    }
}
