//! Room Message Entity
//!
//! The unit of fan-out: one chat message addressed to a room. The same
//! value travels through local delivery, the cross-process relay, and the
//! durable stream log.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::error::GatewayError;

/// A message published to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub msg_id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    /// Sender asked for per-recipient delivery acknowledgment tracking
    #[serde(default)]
    pub requires_ack: bool,
}

impl RoomMessage {
    pub fn new(room_id: Uuid, user_id: Uuid, content: String, requires_ack: bool) -> Self {
        Self {
            // v7 ids are time-ordered, which keeps per-process publish order
            // recoverable from ids alone
            msg_id: Uuid::now_v7(),
            room_id,
            user_id,
            content,
            sent_at: Utc::now(),
            requires_ack,
        }
    }

    /// Encode as flat field pairs for a stream entry.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("msg_id".into(), self.msg_id.to_string()),
            ("room_id".into(), self.room_id.to_string()),
            ("user_id".into(), self.user_id.to_string()),
            ("content".into(), self.content.clone()),
            ("sent_at_ms".into(), self.sent_at.timestamp_millis().to_string()),
            ("requires_ack".into(), u8::from(self.requires_ack).to_string()),
        ]
    }

    /// Decode from stream entry fields.
    pub fn from_fields<'a, I>(fields: I) -> Result<Self, GatewayError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut msg_id = None;
        let mut room_id = None;
        let mut user_id = None;
        let mut content = None;
        let mut sent_at_ms = None;
        let mut requires_ack = false;

        for (key, value) in fields {
            match key {
                "msg_id" => msg_id = value.parse::<Uuid>().ok(),
                "room_id" => room_id = value.parse::<Uuid>().ok(),
                "user_id" => user_id = value.parse::<Uuid>().ok(),
                "content" => content = Some(value.to_string()),
                "sent_at_ms" => sent_at_ms = value.parse::<i64>().ok(),
                "requires_ack" => requires_ack = value == "1",
                _ => {}
            }
        }

        let missing = |field: &str| {
            GatewayError::Internal(format!("stream entry missing field '{}'", field))
        };

        let sent_at_ms = sent_at_ms.ok_or_else(|| missing("sent_at_ms"))?;
        let sent_at = Utc
            .timestamp_millis_opt(sent_at_ms)
            .single()
            .ok_or_else(|| missing("sent_at_ms"))?;

        Ok(Self {
            msg_id: msg_id.ok_or_else(|| missing("msg_id"))?,
            room_id: room_id.ok_or_else(|| missing("room_id"))?,
            user_id: user_id.ok_or_else(|| missing("user_id"))?,
            content: content.ok_or_else(|| missing("content"))?,
            sent_at,
            requires_ack,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn stream_field_encoding_round_trips() {
        let msg = RoomMessage::new(Uuid::new_v4(), Uuid::new_v4(), "hello".into(), true);
        let fields = msg.to_fields();
        let pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let decoded = RoomMessage::from_fields(pairs).unwrap();

        assert_eq!(decoded.msg_id, msg.msg_id);
        assert_eq!(decoded.room_id, msg.room_id);
        assert_eq!(decoded.content, "hello");
        assert!(decoded.requires_ack);
        // Millisecond precision survives the trip
        assert_eq!(
            decoded.sent_at.timestamp_millis(),
            msg.sent_at.timestamp_millis()
        );
    }

    #[test]
    fn missing_fields_are_rejected() {
        let result = RoomMessage::from_fields(vec![("msg_id", "not-a-uuid")]);
        assert!(result.is_err());
    }
}
