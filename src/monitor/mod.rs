//! API monitoring
//!
//! Records every upstream call into a per-service [`MetricRing`], computes
//! latency percentiles and error/cache rates on demand, raises deduplicated
//! alerts and scores service health.
//!
//! # Alert rules
//!
//! | Check | Level |
//! |---|---|
//! | 5 min error rate > 10% with more than 10 samples | critical |
//! | 5 min average response time > 5000ms | warning |
//! | call slower than the service's critical / warning threshold | critical / warning |
//! | call returned 5xx / 4xx | critical / warning |
//!
//! An unresolved alert for the same service and level raised in the last
//! 10 minutes suppresses a new one.

mod alerts;
mod api;
mod event;
pub mod ring;
mod stats;

pub use alerts::{Alert, AlertBook, AlertDetail, AlertFilter, AlertLevel, Raised};
pub use api::{ApiMonitor, HealthLabel, HealthReport, MonitorCleanup, SystemHealth};
pub use event::ApiEvent;
pub use ring::{MetricRing, Timestamped};
pub use stats::{percentile, ServiceStats, TrafficSummary};
