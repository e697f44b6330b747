//! Application Layer
//!
//! Services orchestrating the gateway core components.

pub mod services;

pub use services::{GatewayService, MaintenanceService};
