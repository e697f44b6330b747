//! Infrastructure Layer
//!
//! Redis-backed implementations of the gateway's coordination concerns:
//! the shared store, durable streams, cross-process relay, rate limiting,
//! circuit breaking, distributed locking, delivery tracking, and metrics.

pub mod breaker;
pub mod cache;
pub mod delivery;
pub mod lock;
pub mod metrics;
pub mod rate_limit;
pub mod relay;
pub mod stream;

pub use breaker::{BreakerError, CircuitBreaker, CircuitState};
pub use delivery::{AckOutcome, DeliveryTracker};
pub use lock::DistributedLock;
pub use rate_limit::{RateDecision, RoomRateLimiter};
pub use relay::{NullRelay, RedisRelay, RelayFrame, RelayTransport};
pub use stream::{MemoryStreamLog, RedisStreamLog, StreamLog, StreamRecord, StreamRouter};
