//! Application Services

pub mod gateway_service;
pub mod maintenance_service;

pub use gateway_service::GatewayService;
pub use maintenance_service::{MaintenanceService, STREAM_TRIM_LOCK};
