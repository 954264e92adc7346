//! RelayGate - resilience layer for third-party data provider calls
//!
//! Sits between request handlers and the external providers they wrap
//! (weather, news, IP geolocation, currency and friends) and decides, per
//! request, whether to admit it, serve it from cache, call upstream or
//! fall back to a reduced response.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                            Gateway                                │
//! ├──────────────┬──────────────┬───────────────┬─────────────────────┤
//! │ RateLimiter  │  CacheStore  │ HealthMonitor │ ApiMonitor          │
//! │ fixed window │  TTL + LRU   │ degradation   │ stats + alerts      │
//! │ fail-open    │  adaptive    │ recovery      │ health score        │
//! ├──────────────┴──────────────┴───────────────┴─────────────────────┤
//! │  ErrorLog · RetryPolicy · Maintenance tasks · HTTP surface        │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Per-service TTL cache with pluggable backends
//! - [`clock`] - Time source
//! - [`config`] - Static configuration tables
//! - [`error`] - Error types
//! - [`error_log`] - Upstream error log and trends
//! - [`gateway`] - Request pipeline facade
//! - [`health`] - Service degradation state machine
//! - [`monitor`] - API statistics and alerting
//! - [`ratelimit`] - Fixed-window admission control
//! - [`retry`] - Upstream retry policy
//! - [`server`] - Observability HTTP endpoints
//! - [`tasks`] - Background maintenance

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod error_log;
pub mod gateway;
pub mod health;
pub mod monitor;
pub mod ratelimit;
pub mod retry;
pub mod server;
pub mod tasks;

// Re-export commonly used types
pub use cache::{AdaptiveStrategy, CacheBackend, CacheStore, InMemoryBackend};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{RelayConfig, ResolvedConfig};
pub use error::{Error, Result};
pub use error_log::{ErrorLog, UpstreamError};
pub use gateway::{FetchOutcome, Gateway, Loaded};
pub use health::{ErrorKind, HealthMonitor, ServiceHealth};
pub use monitor::{ApiEvent, ApiMonitor};
pub use ratelimit::{ClientId, Decision, RateLimiter};
pub use retry::RetryPolicy;
pub use tasks::Maintenance;

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
