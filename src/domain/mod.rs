//! Domain Layer
//!
//! Core entities of the gateway: connection lifecycle, room messages,
//! delivery status, and the moderation collaborator seam.

pub mod connection;
pub mod delivery;
pub mod message;
pub mod moderation;

pub use connection::{ConnectionMeta, ConnectionState, RetryQueue};
pub use delivery::{DeliveryRecord, DeliveryStatus};
pub use message::RoomMessage;
pub use moderation::{DisabledModerator, ModerationVerdict, Moderator};
