//! Alert book
//!
//! Alerts are deduplicated per (service, level): while an unresolved alert
//! for the pair is younger than the dedupe window, raising another one is
//! suppressed. Resolved alerts stay in the book until the retention prune.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// The measurement that triggered an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDetail {
    pub metric: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl AlertDetail {
    pub fn new(metric: &str, value: f64, threshold: Option<f64>) -> Self {
        Self {
            metric: metric.to_string(),
            value,
            threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub level: AlertLevel,
    pub service: String,
    pub message: String,
    pub timestamp_ms: u64,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<AlertDetail>,
}

/// Selection for [`AlertBook::recent`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AlertFilter {
    pub service: Option<String>,
    pub level: Option<AlertLevel>,
    /// Defaults to 10
    pub limit: Option<usize>,
}

/// Outcome of raising an alert
#[derive(Debug, Clone, PartialEq)]
pub enum Raised {
    New(Alert),
    /// An open alert for the same service and level already covers it
    Suppressed { existing_id: String },
}

/// Every alert raised, oldest first
#[derive(Debug, Default)]
pub struct AlertBook {
    alerts: Vec<Alert>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise an alert unless an unresolved one for the same service and
    /// level was raised within `dedupe_ms`
    pub fn raise(
        &mut self,
        service: &str,
        level: AlertLevel,
        message: String,
        detail: Option<AlertDetail>,
        now_ms: u64,
        dedupe_ms: u64,
    ) -> Raised {
        if let Some(existing) = self.alerts.iter().find(|a| {
            a.service == service
                && a.level == level
                && !a.resolved
                && now_ms.saturating_sub(a.timestamp_ms) < dedupe_ms
        }) {
            return Raised::Suppressed {
                existing_id: existing.id.clone(),
            };
        }

        let alert = Alert {
            id: format!("{}-{}-{}", service, level, Uuid::new_v4().simple()),
            level,
            service: service.to_string(),
            message,
            timestamp_ms: now_ms,
            resolved: false,
            resolved_at_ms: None,
            detail,
        };
        self.alerts.push(alert.clone());
        Raised::New(alert)
    }

    /// Mark an alert resolved. Returns `false` for an unknown id; resolving
    /// twice keeps the first resolution time.
    pub fn resolve(&mut self, id: &str, now_ms: u64) -> bool {
        match self.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                if !alert.resolved {
                    alert.resolved = true;
                    alert.resolved_at_ms = Some(now_ms);
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Alert> {
        self.alerts.iter().find(|a| a.id == id)
    }

    /// The `limit` most recent unresolved alerts, oldest first
    pub fn active(&self, limit: usize) -> Vec<Alert> {
        let open: Vec<&Alert> = self.alerts.iter().filter(|a| !a.resolved).collect();
        let skip = open.len().saturating_sub(limit);
        open.into_iter().skip(skip).cloned().collect()
    }

    /// Alerts matching `filter`, newest first
    pub fn recent(&self, filter: &AlertFilter) -> Vec<Alert> {
        let mut matched: Vec<&Alert> = self
            .alerts
            .iter()
            .filter(|a| filter.service.as_deref().map_or(true, |s| a.service == s))
            .filter(|a| filter.level.map_or(true, |l| a.level == l))
            .collect();
        // Stable sort keeps insertion order among equal timestamps; reverse it
        matched.reverse();
        matched.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        matched
            .into_iter()
            .take(filter.limit.unwrap_or(10))
            .cloned()
            .collect()
    }

    /// Drop alerts older than `retention_ms`; returns how many went
    pub fn prune(&mut self, now_ms: u64, retention_ms: u64) -> usize {
        let before = self.alerts.len();
        self.alerts
            .retain(|a| now_ms.saturating_sub(a.timestamp_ms) < retention_ms);
        before - self.alerts.len()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const MIN: u64 = 60_000;

    fn raise(book: &mut AlertBook, service: &str, level: AlertLevel, now: u64) -> Raised {
        book.raise(service, level, format!("{} {}", service, level), None, now, 10 * MIN)
    }

    #[test]
    fn test_dedupe_window() {
        let mut book = AlertBook::new();
        let first = match raise(&mut book, "weather", AlertLevel::Critical, 0) {
            Raised::New(alert) => alert,
            other => panic!("expected a new alert, got {:?}", other),
        };

        assert_matches!(
            raise(&mut book, "weather", AlertLevel::Critical, 9 * MIN),
            Raised::Suppressed { existing_id } if existing_id == first.id
        );
        // Different level or service is independent
        assert_matches!(raise(&mut book, "weather", AlertLevel::Warning, 9 * MIN), Raised::New(_));
        assert_matches!(raise(&mut book, "news", AlertLevel::Critical, 9 * MIN), Raised::New(_));
        // Window elapsed
        assert_matches!(raise(&mut book, "weather", AlertLevel::Critical, 10 * MIN), Raised::New(_));
        assert_eq!(book.len(), 4);
    }

    #[test]
    fn test_resolved_alert_does_not_suppress() {
        let mut book = AlertBook::new();
        let Raised::New(alert) = raise(&mut book, "weather", AlertLevel::Critical, 0) else {
            panic!("expected a new alert");
        };
        assert!(book.resolve(&alert.id, MIN));
        assert_matches!(raise(&mut book, "weather", AlertLevel::Critical, 2 * MIN), Raised::New(_));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut book = AlertBook::new();
        let Raised::New(alert) = raise(&mut book, "weather", AlertLevel::Warning, 0) else {
            panic!("expected a new alert");
        };

        assert!(book.resolve(&alert.id, MIN));
        assert!(book.resolve(&alert.id, 2 * MIN));
        let stored = book.get(&alert.id).unwrap();
        assert!(stored.resolved);
        assert_eq!(stored.resolved_at_ms, Some(MIN));
        assert_eq!(book.len(), 1);
        assert!(!book.resolve("missing", MIN));
        assert!(book.active(20).is_empty());
    }

    #[test]
    fn test_active_keeps_latest() {
        let mut book = AlertBook::new();
        for i in 0..25 {
            raise(&mut book, &format!("svc{}", i), AlertLevel::Warning, i);
        }
        let active = book.active(20);
        assert_eq!(active.len(), 20);
        assert_eq!(active[0].service, "svc5");
        assert_eq!(active[19].service, "svc24");
    }

    #[test]
    fn test_recent_filters_newest_first() {
        let mut book = AlertBook::new();
        raise(&mut book, "weather", AlertLevel::Warning, 1);
        raise(&mut book, "news", AlertLevel::Critical, 2);
        raise(&mut book, "weather", AlertLevel::Critical, 3);

        let all = book.recent(&AlertFilter::default());
        assert_eq!(all.iter().map(|a| a.timestamp_ms).collect::<Vec<_>>(), vec![3, 2, 1]);

        let weather = book.recent(&AlertFilter {
            service: Some("weather".into()),
            ..Default::default()
        });
        assert_eq!(weather.len(), 2);

        let critical = book.recent(&AlertFilter {
            level: Some(AlertLevel::Critical),
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].service, "weather");
    }

    #[test]
    fn test_prune() {
        let mut book = AlertBook::new();
        raise(&mut book, "weather", AlertLevel::Warning, 0);
        raise(&mut book, "news", AlertLevel::Warning, 5 * MIN);
        assert_eq!(book.prune(7 * 24 * 60 * MIN, 7 * 24 * 60 * MIN), 1);
        assert_eq!(book.len(), 1);
    }
}
