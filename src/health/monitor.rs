//! Per-service degradation state machine
//!
//! ```text
//!            errors >= threshold, or a severe error
//!  HEALTHY ───────────────────────────────────────► DEGRADED ──► CRITICAL
//!     ▲          (UNAVAILABLE when no fallback)        │  2x threshold
//!     │                                                │
//!     └──────── attempt_recovery after the deadline ───┘
//! ```
//!
//! All services share one lock so a transition and the dependency
//! propagation it triggers are applied together.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::state::{ErrorKind, ServiceHealth, ServiceStatus};
use crate::clock::SharedClock;
use crate::config::{HealthTuning, ResolvedConfig, ResolvedService};
use crate::error::{Error, Result};

/// Static description of a registered service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceProfile {
    pub name: String,
    /// 1 (highest) to 10
    pub priority: u8,
    pub dependencies: Vec<String>,
    pub fallback_available: bool,
    pub critical: bool,
}

impl From<&ResolvedService> for ServiceProfile {
    fn from(service: &ResolvedService) -> Self {
        Self {
            name: service.name.clone(),
            priority: service.priority,
            dependencies: service.dependencies.clone(),
            fallback_available: service.fallback_available,
            critical: service.critical,
        }
    }
}

#[derive(Debug)]
struct Tracked {
    profile: ServiceProfile,
    status: ServiceStatus,
}

/// Result of one periodic sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSweep {
    /// Services whose stale error count was reset
    pub errors_reset: Vec<String>,
    /// Services brought back to healthy
    pub recovered: Vec<String>,
}

/// Degradation state machine for every registered service
pub struct HealthMonitor {
    tuning: HealthTuning,
    services: RwLock<BTreeMap<String, Tracked>>,
    clock: SharedClock,
}

impl HealthMonitor {
    pub fn new(tuning: HealthTuning, clock: SharedClock) -> Self {
        Self {
            tuning,
            services: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    /// Monitor with every configured service registered
    pub fn from_config(config: &ResolvedConfig, clock: SharedClock) -> Self {
        let monitor = Self::new(config.health.clone(), clock);
        for service in config.services.values() {
            monitor.register(ServiceProfile::from(service));
        }
        monitor
    }

    /// Register (or re-register) a service as healthy
    pub fn register(&self, profile: ServiceProfile) {
        let threshold = if profile.critical {
            self.tuning.critical_error_threshold
        } else {
            self.tuning.default_error_threshold
        };
        let status = ServiceStatus::new(&profile.name, threshold);
        debug!(service = %profile.name, threshold, "Registered service");
        self.services
            .write()
            .insert(profile.name.clone(), Tracked { profile, status });
    }

    pub fn is_registered(&self, service: &str) -> bool {
        self.services.read().contains_key(service)
    }

    /// Record a failed upstream call and return the resulting health
    pub fn record_error(&self, service: &str, kind: ErrorKind) -> Result<ServiceHealth> {
        let now = self.clock.now_ms();
        let mut services = self.services.write();
        let tracked = services
            .get_mut(service)
            .ok_or_else(|| Error::UnknownService(service.to_string()))?;

        let status = &mut tracked.status;
        status.error_count += 1;
        status.last_error = Some(kind);
        status.last_error_at_ms = Some(now);

        let mut newly_degraded = false;
        match status.health {
            ServiceHealth::Healthy => {
                if status.error_count >= status.error_threshold || kind.is_severe() {
                    let target = if tracked.profile.fallback_available {
                        ServiceHealth::Degraded
                    } else {
                        ServiceHealth::Unavailable
                    };
                    self.degrade(tracked, target, now, kind);
                    newly_degraded = true;
                }
            }
            current => {
                if current == ServiceHealth::Degraded
                    && status.error_count >= status.error_threshold.saturating_mul(2)
                {
                    status.health = ServiceHealth::Critical;
                    warn!(
                        service = %service,
                        errors = status.error_count,
                        "Service escalated to CRITICAL"
                    );
                }
                if kind.is_severe() {
                    // Still failing hard: restart the recovery clock
                    status.degraded_since_ms = Some(now);
                    status.recovery_attempts = 0;
                    status.next_recovery_at_ms = Some(now + self.tuning.recovery_interval_ms);
                }
            }
        }

        let health = tracked.status.health;
        if newly_degraded {
            self.propagate(&mut services, service, now);
        }
        Ok(health)
    }

    fn degrade(&self, tracked: &mut Tracked, target: ServiceHealth, now: u64, cause: ErrorKind) {
        let status = &mut tracked.status;
        status.health = target;
        status.degraded_since_ms = Some(now);
        status.recovery_attempts = 0;
        status.next_recovery_at_ms = Some(now + self.tuning.recovery_interval_ms);
        warn!(
            service = %status.name,
            health = %target,
            cause = %cause,
            errors = status.error_count,
            "Service degraded"
        );
    }

    /// Force healthy critical dependents of `origin` (transitively) into DEGRADED
    fn propagate(&self, services: &mut BTreeMap<String, Tracked>, origin: &str, now: u64) {
        let mut pending = vec![origin.to_string()];
        while let Some(failed) = pending.pop() {
            let dependents: Vec<String> = services
                .values()
                .filter(|t| {
                    t.profile.critical
                        && t.status.health.is_healthy()
                        && t.profile.dependencies.iter().any(|d| d == &failed)
                })
                .map(|t| t.profile.name.clone())
                .collect();

            for name in dependents {
                if let Some(tracked) = services.get_mut(&name) {
                    let status = &mut tracked.status;
                    status.health = ServiceHealth::Degraded;
                    status.degraded_since_ms = Some(now);
                    status.recovery_attempts = 0;
                    status.next_recovery_at_ms = Some(now + self.tuning.recovery_interval_ms);
                    warn!(service = %name, dependency = %failed, "Dependency degraded, forcing DEGRADED");
                    pending.push(name);
                }
            }
        }
    }

    /// Try to bring a service back to healthy.
    ///
    /// Returns `true` when the service is healthy afterwards. Before the
    /// recovery deadline this is a no-op returning `false`. Past
    /// `max_recovery_attempts` the deadline is pushed out with a growing
    /// multiplier instead.
    pub fn attempt_recovery(&self, service: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut services = self.services.write();
        let tracked = services
            .get_mut(service)
            .ok_or_else(|| Error::UnknownService(service.to_string()))?;
        Ok(self.try_recover(&mut tracked.status, now))
    }

    fn try_recover(&self, status: &mut ServiceStatus, now: u64) -> bool {
        if status.health.is_healthy() {
            return true;
        }
        if status.next_recovery_at_ms.is_some_and(|at| now < at) {
            return false;
        }

        status.recovery_attempts += 1;
        let max = self.tuning.max_recovery_attempts;
        if status.recovery_attempts > max {
            let multiplier = (status.recovery_attempts - max + 1).min(self.tuning.max_backoff_multiplier);
            let delay = self.tuning.recovery_interval_ms * u64::from(multiplier);
            status.next_recovery_at_ms = Some(now + delay);
            info!(
                service = %status.name,
                attempts = status.recovery_attempts,
                retry_in_ms = delay,
                "Recovery postponed"
            );
            return false;
        }

        status.health = ServiceHealth::Healthy;
        status.error_count = 0;
        status.degraded_since_ms = None;
        status.next_recovery_at_ms = None;
        info!(service = %status.name, attempts = status.recovery_attempts, "Service recovered");
        true
    }

    /// Periodic sweep: reset stale error counts and recover services whose
    /// deadline has passed
    pub fn cleanup(&self) -> HealthSweep {
        let now = self.clock.now_ms();
        let mut sweep = HealthSweep::default();
        let mut services = self.services.write();

        for tracked in services.values_mut() {
            let status = &mut tracked.status;
            let stale = status
                .last_error_at_ms
                .is_some_and(|at| now.saturating_sub(at) > self.tuning.error_window_ms);
            if stale && status.error_count > 0 {
                status.error_count = 0;
                sweep.errors_reset.push(status.name.clone());
            }

            let due = !status.health.is_healthy()
                && status.next_recovery_at_ms.is_some_and(|at| now >= at);
            if due && self.try_recover(status, now) {
                sweep.recovered.push(status.name.clone());
            }
        }
        sweep
    }

    /// Current health; a pure read
    pub fn health(&self, service: &str) -> Result<ServiceHealth> {
        self.services
            .read()
            .get(service)
            .map(|t| t.status.health)
            .ok_or_else(|| Error::UnknownService(service.to_string()))
    }

    pub fn status(&self, service: &str) -> Result<ServiceStatus> {
        self.services
            .read()
            .get(service)
            .map(|t| t.status.clone())
            .ok_or_else(|| Error::UnknownService(service.to_string()))
    }

    pub fn profile(&self, service: &str) -> Option<ServiceProfile> {
        self.services.read().get(service).map(|t| t.profile.clone())
    }

    /// Status of every registered service, by name
    pub fn all_statuses(&self) -> Vec<ServiceStatus> {
        self.services
            .read()
            .values()
            .map(|t| t.status.clone())
            .collect()
    }

    /// Milliseconds until the next recovery attempt, if one is scheduled
    pub fn retry_after_ms(&self, service: &str) -> Option<u64> {
        let now = self.clock.now_ms();
        self.services
            .read()
            .get(service)
            .and_then(|t| t.status.next_recovery_at_ms)
            .map(|at| at.saturating_sub(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;

    fn profile(name: &str, critical: bool, fallback: bool, deps: &[&str]) -> ServiceProfile {
        ServiceProfile {
            name: name.to_string(),
            priority: 5,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            fallback_available: fallback,
            critical,
        }
    }

    fn monitor() -> (HealthMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let monitor = HealthMonitor::new(HealthTuning::default(), clock.clone());
        monitor.register(profile("x", false, true, &[]));
        monitor.register(profile("core", true, true, &[]));
        monitor.register(profile("qrcode", false, false, &[]));
        (monitor, clock)
    }

    #[test]
    fn test_degrade_and_recover_round_trip() {
        let (monitor, clock) = monitor();
        for _ in 0..4 {
            assert_eq!(monitor.record_error("x", ErrorKind::Timeout).unwrap(), ServiceHealth::Healthy);
        }
        assert_eq!(monitor.record_error("x", ErrorKind::Timeout).unwrap(), ServiceHealth::Degraded);

        // Too early
        assert!(!monitor.attempt_recovery("x").unwrap());

        clock.advance(Duration::from_millis(60_000));
        assert!(monitor.attempt_recovery("x").unwrap());
        let status = monitor.status("x").unwrap();
        assert_eq!(status.health, ServiceHealth::Healthy);
        assert_eq!(status.error_count, 0);
        assert!(status.next_recovery_at_ms.is_none());
        assert!(status.degraded_since_ms.is_none());
    }

    #[test]
    fn test_critical_threshold_is_lower() {
        let (monitor, _) = monitor();
        monitor.record_error("core", ErrorKind::Timeout).unwrap();
        monitor.record_error("core", ErrorKind::Timeout).unwrap();
        assert_eq!(monitor.record_error("core", ErrorKind::Timeout).unwrap(), ServiceHealth::Degraded);
        assert_eq!(monitor.status("core").unwrap().error_threshold, 3);
    }

    #[test]
    fn test_severe_error_degrades_immediately() {
        let (monitor, clock) = monitor();
        assert_eq!(monitor.record_error("x", ErrorKind::Storage).unwrap(), ServiceHealth::Degraded);
        let status = monitor.status("x").unwrap();
        assert_eq!(status.degraded_since_ms, Some(clock.now_ms()));
        assert_eq!(status.next_recovery_at_ms, Some(clock.now_ms() + 60_000));
    }

    #[test]
    fn test_no_fallback_goes_unavailable() {
        let (monitor, _) = monitor();
        assert_eq!(monitor.record_error("qrcode", ErrorKind::Server).unwrap(), ServiceHealth::Unavailable);
    }

    #[test]
    fn test_escalates_to_critical() {
        let (monitor, _) = monitor();
        for _ in 0..9 {
            monitor.record_error("x", ErrorKind::ExternalApi).unwrap();
        }
        assert_eq!(monitor.health("x").unwrap(), ServiceHealth::Degraded);
        assert_eq!(monitor.record_error("x", ErrorKind::ExternalApi).unwrap(), ServiceHealth::Critical);
    }

    #[test]
    fn test_severe_error_restarts_recovery_clock() {
        let (monitor, clock) = monitor();
        monitor.record_error("x", ErrorKind::Server).unwrap();
        clock.advance(Duration::from_millis(50_000));
        monitor.record_error("x", ErrorKind::Server).unwrap();

        clock.advance(Duration::from_millis(20_000));
        assert!(!monitor.attempt_recovery("x").unwrap());
        clock.advance(Duration::from_millis(40_000));
        assert!(monitor.attempt_recovery("x").unwrap());
    }

    #[test]
    fn test_backoff_after_max_attempts() {
        let (monitor, clock) = monitor();
        monitor.record_error("x", ErrorKind::Server).unwrap();
        clock.advance(Duration::from_millis(60_000));

        monitor.services.write().get_mut("x").unwrap().status.recovery_attempts = 3;
        assert!(!monitor.attempt_recovery("x").unwrap());

        let status = monitor.status("x").unwrap();
        assert_eq!(status.recovery_attempts, 4);
        // multiplier min(4 - 3 + 1, 10) = 2
        assert_eq!(status.next_recovery_at_ms, Some(clock.now_ms() + 120_000));
        assert_eq!(status.health, ServiceHealth::Degraded);
    }

    #[test]
    fn test_critical_dependents_follow() {
        let clock = Arc::new(ManualClock::default());
        let monitor = HealthMonitor::new(HealthTuning::default(), clock);
        monitor.register(profile("geocode", false, true, &[]));
        monitor.register(profile("weather", true, true, &["geocode"]));
        monitor.register(profile("dashboard", true, true, &["weather"]));
        monitor.register(profile("news", false, true, &["geocode"]));

        monitor.record_error("geocode", ErrorKind::Resource).unwrap();

        assert_eq!(monitor.health("weather").unwrap(), ServiceHealth::Degraded);
        assert_eq!(monitor.health("dashboard").unwrap(), ServiceHealth::Degraded);
        // Non-critical dependents keep serving
        assert_eq!(monitor.health("news").unwrap(), ServiceHealth::Healthy);
        assert_eq!(monitor.status("weather").unwrap().error_count, 0);
    }

    #[test]
    fn test_cleanup_resets_stale_errors_and_recovers() {
        let (monitor, clock) = monitor();
        monitor.record_error("x", ErrorKind::Timeout).unwrap();
        monitor.record_error("core", ErrorKind::Server).unwrap();

        clock.advance(Duration::from_millis(60_000));
        let sweep = monitor.cleanup();
        assert_eq!(sweep.recovered, vec!["core".to_string()]);
        assert!(sweep.errors_reset.is_empty());
        assert_eq!(monitor.status("x").unwrap().error_count, 1);

        clock.advance(Duration::from_millis(5 * 60_000));
        let sweep = monitor.cleanup();
        assert_eq!(sweep.errors_reset, vec!["x".to_string()]);
        assert_eq!(monitor.status("x").unwrap().error_count, 0);
    }

    #[test]
    fn test_unknown_service() {
        let (monitor, _) = monitor();
        assert_matches!(monitor.record_error("nope", ErrorKind::Server), Err(Error::UnknownService(_)));
        assert_matches!(monitor.health("nope"), Err(Error::UnknownService(_)));
        assert_matches!(monitor.attempt_recovery("nope"), Err(Error::UnknownService(_)));
    }

    #[test]
    fn test_from_config() {
        let config = crate::config::RelayConfig::builtin().resolve().unwrap();
        let monitor = HealthMonitor::from_config(&config, Arc::new(ManualClock::default()));
        assert_eq!(monitor.all_statuses().len(), 8);
        assert!(!monitor.profile("qrcode").unwrap().fallback_available);
        assert_eq!(monitor.retry_after_ms("weather"), None);
    }
}
