//! # Chat Gateway
//!
//! Real-time room messaging gateway with cross-process fan-out:
//! - WebSocket endpoint accepting persistent client connections
//! - Connection registry with an explicit lifecycle state machine
//! - Room-scoped broadcast engine (local direct delivery + relayed
//!   batches to peer processes)
//! - Redis for coordination: rate limit windows, distributed locks,
//!   durable streams with consumer groups, delivery records
//!
//! ## Architecture
//!
//! The crate follows Clean Architecture principles:
//!
//! - **Domain Layer**: Connection state machine, room messages, delivery
//!   status, collaborator seams
//! - **Application Layer**: The gateway orchestrator and scheduled
//!   maintenance
//! - **Infrastructure Layer**: Redis-backed store, streams, relay, rate
//!   limiter, circuit breaker, lock, metrics
//! - **Presentation Layer**: WebSocket handler and the thin HTTP surface
//!
//! ## Module Structure
//!
//! ```text
//! chat_gateway/
//! +-- config/         Configuration management
//! +-- domain/         Entities and collaborator traits
//! +-- application/    Orchestration services
//! +-- infrastructure/ Store, streams, relay, breaker, lock, metrics
//! +-- presentation/   WebSocket gateway and HTTP routes
//! +-- shared/         Common error types
//! ```
//!
//! ## Ordering and failure policy
//!
//! Message order is preserved for clients connected to the process that
//! originates a publish; cross-process ordering is approximate (best
//! effort by publish time, not globally sequenced). Shared-store failure
//! handling is deliberately asymmetric: the rate limiter fails open, the
//! distributed lock and durable-log writes fail closed, and circuit
//! breaker state is process-local.

// Configuration module
pub mod config;

// Domain layer - Core entities
pub mod domain;

// Application layer - Orchestration services
pub mod application;

// Infrastructure layer - External implementations
pub mod infrastructure;

// Presentation layer - WebSocket and HTTP handlers
pub mod presentation;

// Shared utilities
pub mod shared;

// Application startup and state management
pub mod startup;

// Telemetry and observability
pub mod telemetry;
