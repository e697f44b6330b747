//! Presentation Layer
//!
//! WebSocket gateway and the thin HTTP surface around it.

pub mod http;
pub mod middleware;
pub mod websocket;
