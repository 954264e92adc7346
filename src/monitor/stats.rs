//! Aggregates computed from recorded events

use serde::Serialize;

use super::event::ApiEvent;

/// Per-service request statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ServiceStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_response_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_response_ms: f64,
    /// Fraction of requests with status >= 400
    pub error_rate: f64,
    /// Fraction of requests served from cache
    pub cache_hit_rate: f64,
}

impl ServiceStats {
    /// Statistics over `events`; all zero when empty
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a ApiEvent>) -> Self {
        let mut times = Vec::new();
        let mut errors = 0u64;
        let mut cache_hits = 0u64;
        for event in events {
            times.push(event.response_time_ms);
            if event.is_error() {
                errors += 1;
            }
            if event.cache_hit {
                cache_hits += 1;
            }
        }

        let total = times.len() as u64;
        if total == 0 {
            return Self::default();
        }
        times.sort_by(f64::total_cmp);

        let n = total as f64;
        Self {
            total_requests: total,
            success_count: total - errors,
            error_count: errors,
            avg_response_ms: times.iter().sum::<f64>() / n,
            p50_ms: percentile(&times, 0.50),
            p95_ms: percentile(&times, 0.95),
            p99_ms: percentile(&times, 0.99),
            max_response_ms: times[times.len() - 1],
            error_rate: errors as f64 / n,
            cache_hit_rate: cache_hits as f64 / n,
        }
    }
}

/// Value at index `floor(n * q)` of an ascending slice; 0 when empty
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * q).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Totals across every service
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TrafficSummary {
    pub total_requests: u64,
    pub error_requests: u64,
    pub error_rate: f64,
    /// Mean of the per-service averages
    pub avg_response_ms: f64,
}

impl TrafficSummary {
    pub fn from_services<'a>(stats: impl IntoIterator<Item = &'a ServiceStats>) -> Self {
        let mut summary = Self::default();
        let mut services = 0usize;
        let mut response_sum = 0.0;
        for s in stats {
            services += 1;
            summary.total_requests += s.total_requests;
            summary.error_requests += s.error_count;
            response_sum += s.avg_response_ms;
        }
        if services > 0 {
            summary.avg_response_ms = response_sum / services as f64;
        }
        if summary.total_requests > 0 {
            summary.error_rate = summary.error_requests as f64 / summary.total_requests as f64;
        }
        summary
    }
}
