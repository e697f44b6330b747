//! WebSocket Gateway
//!
//! Connection registry, broadcast engine, wire formats, and the socket
//! handler.

pub mod broadcast;
pub mod handler;
pub mod messages;
pub mod registry;

pub use broadcast::{BroadcastEngine, LocalDelivery};
pub use handler::ws_handler;
pub use messages::{Envelope, MessagePayload, OutboundFrame};
pub use registry::{ConnectionRegistry, RoomMember};
