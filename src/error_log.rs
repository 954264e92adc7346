//! Upstream error log and trend analysis
//!
//! Keeps the last 1000 classified upstream failures for 24 hours and turns
//! them into per-kind trends and a daily report. High and critical records
//! are logged at `error` level as they arrive.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::health::ErrorKind;

const HOUR_MS: u64 = 3_600_000;
const DAY_MS: u64 = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Default severity of an error kind
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Validation | ErrorKind::Request | ErrorKind::RateLimit => Severity::Low,
            ErrorKind::Authentication
            | ErrorKind::Authorization
            | ErrorKind::NotFound
            | ErrorKind::ExternalApi
            | ErrorKind::Timeout
            | ErrorKind::Unknown => Severity::Medium,
            ErrorKind::Server
            | ErrorKind::Storage
            | ErrorKind::Cache
            | ErrorKind::Network
            | ErrorKind::Dns => Severity::High,
            ErrorKind::Resource => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Where a failure originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    Client,
    Server,
    Network,
    External,
}

impl ErrorSource {
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Validation
            | ErrorKind::Authentication
            | ErrorKind::Authorization
            | ErrorKind::RateLimit
            | ErrorKind::Request
            | ErrorKind::NotFound => ErrorSource::Client,
            ErrorKind::ExternalApi | ErrorKind::Timeout => ErrorSource::External,
            ErrorKind::Network | ErrorKind::Dns => ErrorSource::Network,
            ErrorKind::Server
            | ErrorKind::Storage
            | ErrorKind::Cache
            | ErrorKind::Resource
            | ErrorKind::Unknown => ErrorSource::Server,
        }
    }
}

/// A failed upstream call as reported by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamError {
    pub kind: ErrorKind,
    /// Short machine-readable code, e.g. `WEATHER_API_TIMEOUT`
    pub code: String,
    pub message: String,
    /// Overrides the kind's default severity
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub service: Option<String>,
}

impl UpstreamError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            severity: None,
            status: None,
            service: None,
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.kind, self.message)
    }
}

/// Request details attached to a record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub id: String,
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub source: ErrorSource,
    pub retryable: bool,
    pub status: u16,
    pub timestamp_ms: u64,
    pub service: Option<String>,
    pub context: ErrorContext,
}

/// Selection for [`ErrorLog::query`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ErrorQuery {
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
    pub kind: Option<ErrorKind>,
    pub severity: Option<Severity>,
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorTrend {
    pub kind: ErrorKind,
    pub count: usize,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    /// Occurrences per hour over the first..last span
    pub per_hour: f64,
    /// More occurrences in the second half of the span than the first
    pub is_increasing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub timestamp_ms: u64,
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub top: Vec<ErrorTrend>,
    pub recommendations: Vec<String>,
}

pub struct ErrorLog {
    records: Mutex<VecDeque<ErrorRecord>>,
    capacity: usize,
    retention_ms: u64,
    clock: SharedClock,
}

impl ErrorLog {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_limits(1000, DAY_MS, clock)
    }

    pub fn with_limits(capacity: usize, retention_ms: u64, clock: SharedClock) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            retention_ms,
            clock,
        }
    }

    /// Classify and store a failure; returns the record id
    pub fn log(&self, err: &UpstreamError, context: ErrorContext) -> String {
        let now = self.clock.now_ms();
        let simple = Uuid::new_v4().simple().to_string();
        let id = format!("err_{}_{}", now, &simple[..8]);

        let record = ErrorRecord {
            id: id.clone(),
            kind: err.kind,
            code: err.code.clone(),
            message: err.message.clone(),
            severity: err.severity.unwrap_or_else(|| Severity::for_kind(err.kind)),
            source: ErrorSource::for_kind(err.kind),
            retryable: err.kind.is_retryable(),
            status: err.status.unwrap_or_else(|| err.kind.http_status()),
            timestamp_ms: now,
            service: err.service.clone(),
            context,
        };

        if record.severity >= Severity::High {
            error!(
                id = %record.id,
                kind = %record.kind,
                code = %record.code,
                service = record.service.as_deref().unwrap_or("-"),
                "{}",
                record.message
            );
        } else {
            debug!(id = %record.id, kind = %record.kind, code = %record.code, "Recorded upstream error");
        }

        let mut records = self.records.lock();
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
        id
    }

    pub fn get(&self, id: &str) -> Option<ErrorRecord> {
        self.records.lock().iter().find(|r| r.id == id).cloned()
    }

    /// Matching records, oldest first
    pub fn query(&self, q: &ErrorQuery) -> Vec<ErrorRecord> {
        let records = self.records.lock();
        let matched = records
            .iter()
            .filter(|r| q.start_ms.map_or(true, |s| r.timestamp_ms >= s))
            .filter(|r| q.end_ms.map_or(true, |e| r.timestamp_ms <= e))
            .filter(|r| q.kind.map_or(true, |k| r.kind == k))
            .filter(|r| q.severity.map_or(true, |s| r.severity == s))
            .skip(q.offset);
        match q.limit {
            Some(limit) => matched.take(limit).cloned().collect(),
            None => matched.cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Drop records past retention; returns how many went
    pub fn cleanup(&self) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(self.retention_ms);
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.timestamp_ms >= cutoff);
        before - records.len()
    }

    /// Per-kind trends over the last `window_ms`, most frequent first.
    /// Kinds seen fewer than twice are left out.
    pub fn trends(&self, window_ms: u64) -> Vec<ErrorTrend> {
        let cutoff = self.clock.now_ms().saturating_sub(window_ms);
        let mut groups: BTreeMap<ErrorKind, Vec<u64>> = BTreeMap::new();
        for r in self.records.lock().iter().filter(|r| r.timestamp_ms >= cutoff) {
            groups.entry(r.kind).or_default().push(r.timestamp_ms);
        }

        let mut trends: Vec<ErrorTrend> = groups
            .into_iter()
            .filter(|(_, times)| times.len() >= 2)
            .map(|(kind, mut times)| {
                times.sort_unstable();
                let first = times[0];
                let last = times[times.len() - 1];
                let span_hours = (last - first) as f64 / HOUR_MS as f64;
                let count = times.len();
                let per_hour = if span_hours > 0.0 {
                    count as f64 / span_hours
                } else {
                    count as f64
                };

                let midpoint = first as f64 + (last - first) as f64 / 2.0;
                let first_half = times.iter().filter(|t| (**t as f64) < midpoint).count();
                let second_half = count - first_half;

                ErrorTrend {
                    kind,
                    count,
                    first_seen_ms: first,
                    last_seen_ms: last,
                    per_hour,
                    is_increasing: second_half > first_half,
                }
            })
            .collect();
        // Stable: equal counts keep kind order
        trends.sort_by(|a, b| b.count.cmp(&a.count));
        trends
    }

    /// Daily summary with the top five trends and advice
    pub fn report(&self) -> ErrorReport {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(DAY_MS);

        let mut by_severity: BTreeMap<Severity, usize> = [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ]
        .into_iter()
        .map(|s| (s, 0))
        .collect();
        let mut total = 0;
        for r in self.records.lock().iter().filter(|r| r.timestamp_ms >= cutoff) {
            total += 1;
            *by_severity.entry(r.severity).or_default() += 1;
        }

        let trends = self.trends(DAY_MS);
        let top: Vec<ErrorTrend> = trends.iter().take(5).cloned().collect();

        let mut recommendations = Vec::new();
        let critical = by_severity.get(&Severity::Critical).copied().unwrap_or(0);
        if critical > 0 {
            recommendations.push(format!("{} critical errors need immediate attention", critical));
        }
        if let Some(rising) = trends.iter().find(|t| t.is_increasing) {
            recommendations.push(format!(
                "{} errors are trending up, investigate them first",
                rising.kind
            ));
        }
        for trend in &top {
            let hint = match trend.kind {
                ErrorKind::ExternalApi => {
                    "frequent external API errors: check provider status or strengthen fallbacks"
                }
                ErrorKind::Storage => {
                    "frequent storage errors: check connections and query performance"
                }
                ErrorKind::Validation => {
                    "frequent validation errors: tighten client-side validation or document inputs"
                }
                ErrorKind::Timeout => {
                    "frequent timeouts: optimize slow paths or raise the timeout budget"
                }
                _ => continue,
            };
            recommendations.push(hint.to_string());
        }
        if recommendations.is_empty() && total > 0 {
            recommendations.push(format!(
                "{} errors in the last 24 hours, review the error log regularly",
                total
            ));
        }

        ErrorReport {
            timestamp_ms: now,
            total,
            by_severity,
            top,
            recommendations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn log() -> (ErrorLog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (ErrorLog::new(clock.clone()), clock)
    }

    fn err(kind: ErrorKind) -> UpstreamError {
        UpstreamError::new(kind, "TEST", "boom").with_service("weather")
    }

    #[test]
    fn test_classification() {
        let (log, _) = log();
        let id = log.log(&err(ErrorKind::Timeout), ErrorContext::default());
        let record = log.get(&id).unwrap();

        assert!(id.starts_with("err_"));
        assert_eq!(record.severity, Severity::Medium);
        assert_eq!(record.source, ErrorSource::External);
        assert!(record.retryable);
        assert_eq!(record.status, 408);

        let id = log.log(
            &err(ErrorKind::Validation).with_severity(Severity::High).with_status(422),
            ErrorContext::default(),
        );
        let record = log.get(&id).unwrap();
        assert_eq!(record.severity, Severity::High);
        assert_eq!(record.status, 422);
        assert!(!record.retryable);
        assert_eq!(Severity::for_kind(ErrorKind::Resource), Severity::Critical);
    }

    #[test]
    fn test_capacity() {
        let clock = Arc::new(ManualClock::default());
        let log = ErrorLog::with_limits(3, DAY_MS, clock);
        let ids: Vec<String> = (0..5)
            .map(|_| log.log(&err(ErrorKind::Server), ErrorContext::default()))
            .collect();
        assert_eq!(log.len(), 3);
        assert!(log.get(&ids[0]).is_none());
        assert!(log.get(&ids[4]).is_some());
    }

    #[test]
    fn test_query_filters_and_pages() {
        let (log, clock) = log();
        for i in 0..6 {
            let kind = if i % 2 == 0 { ErrorKind::Timeout } else { ErrorKind::Server };
            log.log(&err(kind), ErrorContext::default());
            clock.advance(Duration::from_secs(1));
        }

        let timeouts = log.query(&ErrorQuery {
            kind: Some(ErrorKind::Timeout),
            ..Default::default()
        });
        assert_eq!(timeouts.len(), 3);

        let page = log.query(&ErrorQuery {
            offset: 1,
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(page.len(), 2);

        let high = log.query(&ErrorQuery {
            severity: Some(Severity::High),
            ..Default::default()
        });
        assert!(high.iter().all(|r| r.kind == ErrorKind::Server));
    }

    #[test]
    fn test_cleanup() {
        let (log, clock) = log();
        log.log(&err(ErrorKind::Server), ErrorContext::default());
        clock.advance(Duration::from_secs(12 * 3600));
        log.log(&err(ErrorKind::Server), ErrorContext::default());
        clock.advance(Duration::from_secs(12 * 3600 + 1));

        assert_eq!(log.cleanup(), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_trends() {
        let (log, clock) = log();
        // Timeouts: one early, three late -> increasing over a 2.5h span
        log.log(&err(ErrorKind::Timeout), ErrorContext::default());
        clock.advance(Duration::from_secs(3600 + 1800));
        for _ in 0..3 {
            log.log(&err(ErrorKind::Timeout), ErrorContext::default());
            clock.advance(Duration::from_secs(1800));
        }
        // A single storage error has no trend
        log.log(&err(ErrorKind::Storage), ErrorContext::default());

        let trends = log.trends(DAY_MS);
        assert_eq!(trends.len(), 1);
        let t = &trends[0];
        assert_eq!(t.kind, ErrorKind::Timeout);
        assert_eq!(t.count, 4);
        assert!(t.is_increasing);
        assert!((t.per_hour - 1.6).abs() < 1e-9);
    }

    #[test]
    fn test_zero_span_frequency() {
        let (log, _) = log();
        log.log(&err(ErrorKind::Network), ErrorContext::default());
        log.log(&err(ErrorKind::Network), ErrorContext::default());
        let trends = log.trends(HOUR_MS);
        assert_eq!(trends[0].per_hour, 2.0);
        assert!(!trends[0].is_increasing);
    }

    #[test]
    fn test_report() {
        let (log, clock) = log();
        log.log(&err(ErrorKind::Resource), ErrorContext::default());
        for _ in 0..2 {
            log.log(&err(ErrorKind::ExternalApi), ErrorContext::default());
            clock.advance(Duration::from_secs(60));
        }

        let report = log.report();
        assert_eq!(report.total, 3);
        assert_eq!(report.by_severity[&Severity::Critical], 1);
        assert_eq!(report.by_severity[&Severity::Medium], 2);
        assert_eq!(report.by_severity[&Severity::Low], 0);
        assert_eq!(report.top.len(), 1);
        assert_eq!(report.recommendations[0], "1 critical errors need immediate attention");
        assert!(report.recommendations.iter().any(|r| r.contains("external API")));
    }

    #[test]
    fn test_report_generic_advice() {
        let (log, _) = log();
        assert!(log.report().recommendations.is_empty());
        log.log(&err(ErrorKind::NotFound), ErrorContext::default());
        assert_eq!(
            log.report().recommendations,
            vec!["1 errors in the last 24 hours, review the error log regularly"]
        );
    }
}
