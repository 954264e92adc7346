//! Service health and degradation
//!
//! Tracks upstream failures per registered service and decides whether the
//! caller should take the full-feature path or a reduced one.
//!
//! # States
//!
//! - `HEALTHY`: full responses
//! - `DEGRADED`: error threshold crossed (3 for critical services, 5
//!   otherwise) or a severe fault (server, storage, resource) seen
//! - `CRITICAL`: still failing at twice the threshold while degraded
//! - `UNAVAILABLE`: degraded with no fallback available
//!
//! A degraded service becomes eligible for recovery one recovery interval
//! after it degraded. Recovery is optimistic: the next successful attempt
//! returns it to `HEALTHY` with a zero error count.

mod monitor;
mod state;

pub use monitor::{HealthMonitor, HealthSweep, ServiceProfile};
pub use state::{ErrorKind, ServiceHealth, ServiceStatus};
