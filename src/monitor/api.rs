//! API monitor
//!
//! Keeps a ring of recent calls per service, derives statistics on demand
//! and raises alerts after every recorded call:
//!
//! - trailing window: error rate above the limit (with enough samples) is
//!   critical, a slow average is a warning
//! - the call itself: response time over the service's critical/warning
//!   threshold, and 5xx/4xx statuses

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};

use super::alerts::{Alert, AlertBook, AlertDetail, AlertFilter, AlertLevel, Raised};
use super::event::ApiEvent;
use super::ring::MetricRing;
use super::stats::{ServiceStats, TrafficSummary};
use crate::clock::SharedClock;
use crate::config::{MonitorTuning, ResolvedConfig, Thresholds};

/// Overall health label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLabel {
    Healthy,
    NeedsAttention,
    Unhealthy,
}

impl HealthLabel {
    pub fn from_score(score: u8) -> Self {
        if score > 80 {
            HealthLabel::Healthy
        } else if score > 60 {
            HealthLabel::NeedsAttention
        } else {
            HealthLabel::Unhealthy
        }
    }
}

/// System score and per-service scores
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemHealth {
    pub score: u8,
    pub services: BTreeMap<String, u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub score: u8,
    pub status: HealthLabel,
    pub services: BTreeMap<String, u8>,
    pub recent_alerts: Vec<Alert>,
    pub performance: TrafficSummary,
}

/// What a maintenance pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorCleanup {
    pub events_pruned: usize,
    pub alerts_pruned: usize,
}

type Ring = Arc<Mutex<MetricRing<ApiEvent>>>;

pub struct ApiMonitor {
    tuning: MonitorTuning,
    default_thresholds: Thresholds,
    thresholds: HashMap<String, Thresholds>,
    events: DashMap<String, Ring>,
    alerts: Mutex<AlertBook>,
    alerts_raised: AtomicU64,
    clock: SharedClock,
}

impl ApiMonitor {
    pub fn new(
        tuning: MonitorTuning,
        default_thresholds: Thresholds,
        thresholds: HashMap<String, Thresholds>,
        clock: SharedClock,
    ) -> Self {
        Self {
            tuning,
            default_thresholds,
            thresholds,
            events: DashMap::new(),
            alerts: Mutex::new(AlertBook::new()),
            alerts_raised: AtomicU64::new(0),
            clock,
        }
    }

    pub fn from_config(config: &ResolvedConfig, clock: SharedClock) -> Self {
        let thresholds = config
            .services
            .values()
            .map(|s| (s.name.clone(), s.thresholds.clone()))
            .collect();
        Self::new(
            config.monitor.clone(),
            config.default_thresholds.clone(),
            thresholds,
            clock,
        )
    }

    /// Thresholds applied to a service
    pub fn thresholds(&self, service: &str) -> &Thresholds {
        self.thresholds.get(service).unwrap_or(&self.default_thresholds)
    }

    fn ring(&self, service: &str) -> Ring {
        if let Some(ring) = self.events.get(service) {
            return ring.value().clone();
        }
        self.events
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(MetricRing::new(
                    self.tuning.max_events_per_service,
                    self.tuning.event_retention_ms,
                )))
            })
            .value()
            .clone()
    }

    /// Record a call and run the alert checks; returns newly raised alerts
    pub fn record(&self, event: ApiEvent) -> Vec<Alert> {
        let now = self.clock.now_ms();
        let service = event.service.clone();
        let ring = self.ring(&service);

        let window = {
            let mut ring = ring.lock();
            ring.push(event.clone(), now);
            ring.since(now.saturating_sub(self.tuning.alert_window_ms))
        };

        let mut findings = self.window_findings(&window);
        findings.extend(self.event_findings(&event));
        if findings.is_empty() {
            return Vec::new();
        }

        let mut raised = Vec::new();
        let mut book = self.alerts.lock();
        for (level, message, detail) in findings {
            if let Raised::New(alert) =
                book.raise(&service, level, message, Some(detail), now, self.tuning.alert_dedupe_ms)
            {
                self.alerts_raised.fetch_add(1, Ordering::Relaxed);
                match alert.level {
                    AlertLevel::Critical => {
                        error!(service = %service, alert = %alert.id, "{}", alert.message)
                    }
                    _ => warn!(service = %service, alert = %alert.id, "{}", alert.message),
                }
                raised.push(alert);
            }
        }
        raised
    }

    fn window_findings(&self, window: &[ApiEvent]) -> Vec<(AlertLevel, String, AlertDetail)> {
        let mut findings = Vec::new();
        let stats = ServiceStats::from_events(window);

        if window.len() >= self.tuning.alert_min_samples
            && stats.error_rate > self.tuning.alert_error_rate
        {
            findings.push((
                AlertLevel::Critical,
                format!("High error rate: {:.1}%", stats.error_rate * 100.0),
                AlertDetail::new("error_rate", stats.error_rate, Some(self.tuning.alert_error_rate)),
            ));
        }
        if stats.avg_response_ms > self.tuning.alert_avg_response_ms {
            findings.push((
                AlertLevel::Warning,
                format!("Slow responses: average {:.0}ms", stats.avg_response_ms),
                AlertDetail::new(
                    "avg_response_time",
                    stats.avg_response_ms,
                    Some(self.tuning.alert_avg_response_ms),
                ),
            ));
        }
        findings
    }

    fn event_findings(&self, event: &ApiEvent) -> Vec<(AlertLevel, String, AlertDetail)> {
        let mut findings = Vec::new();
        let t = self.thresholds(&event.service);
        let rt = event.response_time_ms;

        if rt > t.response_time_critical_ms {
            findings.push((
                AlertLevel::Critical,
                format!("Response time critically high: {:.0}ms", rt),
                AlertDetail::new("response_time", rt, Some(t.response_time_critical_ms)),
            ));
        } else if rt > t.response_time_warning_ms {
            findings.push((
                AlertLevel::Warning,
                format!("Response time above target: {:.0}ms", rt),
                AlertDetail::new("response_time", rt, Some(t.response_time_warning_ms)),
            ));
        }

        let status = f64::from(event.status_code);
        if event.status_code >= 500 {
            findings.push((
                AlertLevel::Critical,
                format!("Upstream server error: {}", event.status_code),
                AlertDetail::new("status_code", status, None),
            ));
        } else if event.status_code >= 400 {
            findings.push((
                AlertLevel::Warning,
                format!("Upstream request error: {}", event.status_code),
                AlertDetail::new("status_code", status, None),
            ));
        }
        findings
    }

    /// Statistics over every retained event of a service
    pub fn service_stats(&self, service: &str) -> ServiceStats {
        let Some(ring) = self.events.get(service).map(|r| r.value().clone()) else {
            return ServiceStats::default();
        };
        let ring = ring.lock();
        ServiceStats::from_events(ring.iter())
    }

    /// Statistics of every service that has recorded traffic
    pub fn all_stats(&self) -> BTreeMap<String, ServiceStats> {
        let services: Vec<String> = self.events.iter().map(|e| e.key().clone()).collect();
        services
            .into_iter()
            .map(|name| {
                let stats = self.service_stats(&name);
                (name, stats)
            })
            .filter(|(_, stats)| stats.total_requests > 0)
            .collect()
    }

    /// Totals across services
    pub fn summary(&self) -> TrafficSummary {
        TrafficSummary::from_services(self.all_stats().values())
    }

    /// Most recent unresolved alerts, oldest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().active(self.tuning.active_alert_limit)
    }

    /// Alerts matching the filter (resolved included), newest first
    pub fn recent_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.alerts.lock().recent(filter)
    }

    pub fn alert(&self, id: &str) -> Option<Alert> {
        self.alerts.lock().get(id).cloned()
    }

    /// Mark an alert resolved; `false` when the id is unknown
    pub fn resolve_alert(&self, id: &str) -> bool {
        let now = self.clock.now_ms();
        self.alerts.lock().resolve(id, now)
    }

    /// Alerts raised since start
    pub fn alerts_raised(&self) -> u64 {
        self.alerts_raised.load(Ordering::Relaxed)
    }

    /// 0..=100 score for a service; 100 without traffic
    pub fn health_score(&self, service: &str) -> u8 {
        let stats = self.service_stats(service);
        if stats.total_requests == 0 {
            return 100;
        }
        self.score(service, &stats)
    }

    fn score(&self, service: &str, stats: &ServiceStats) -> u8 {
        let t = self.thresholds(service);
        let mut score: i32 = 100;

        if stats.error_rate > t.error_rate_critical {
            score -= 30;
        } else if stats.error_rate > t.error_rate_warning {
            score -= 15;
        }

        if stats.avg_response_ms > t.response_time_critical_ms {
            score -= 25;
        } else if stats.avg_response_ms > t.response_time_warning_ms {
            score -= 10;
        }

        if stats.cache_hit_rate < t.cache_hit_rate_floor {
            score -= 10;
        }

        let recent = self.recent_alerts(&AlertFilter {
            service: Some(service.to_string()),
            level: None,
            limit: Some(10),
        });
        for alert in &recent {
            score -= match alert.level {
                AlertLevel::Critical => 5,
                AlertLevel::Warning => 2,
                AlertLevel::Info => 0,
            };
        }

        score.clamp(0, 100) as u8
    }

    /// Mean score over services with traffic; 100 when there are none
    pub fn system_health(&self) -> SystemHealth {
        let services: BTreeMap<String, u8> = self
            .all_stats()
            .iter()
            .map(|(name, stats)| (name.clone(), self.score(name, stats)))
            .collect();

        let score = if services.is_empty() {
            100
        } else {
            let total: u32 = services.values().map(|s| u32::from(*s)).sum();
            (f64::from(total) / services.len() as f64).round() as u8
        };
        SystemHealth { score, services }
    }

    pub fn health_report(&self) -> HealthReport {
        let now = self.clock.now_ms();
        let system = self.system_health();
        HealthReport {
            generated_at: DateTime::from_timestamp_millis(now as i64).unwrap_or_default(),
            score: system.score,
            status: HealthLabel::from_score(system.score),
            services: system.services,
            recent_alerts: self.recent_alerts(&AlertFilter {
                limit: Some(5),
                ..Default::default()
            }),
            performance: self.summary(),
        }
    }

    /// Drop events and alerts past retention
    pub fn cleanup(&self) -> MonitorCleanup {
        let now = self.clock.now_ms();
        let rings: Vec<Ring> = self.events.iter().map(|e| e.value().clone()).collect();
        let events_pruned = rings.iter().map(|ring| ring.lock().prune(now)).sum();
        let alerts_pruned = self
            .alerts
            .lock()
            .prune(now, self.tuning.alert_retention_ms);
        MonitorCleanup {
            events_pruned,
            alerts_pruned,
        }
    }
}
