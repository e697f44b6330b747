//! Configuration Management
//!
//! Settings loading from files and environment variables.

mod settings;

pub use settings::{
    BreakerSettings, BroadcastSettings, CorsSettings, GatewaySettings, MaintenanceSettings,
    RateLimitSettings, RedisSettings, ServerSettings, Settings,
};
