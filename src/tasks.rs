//! Background maintenance
//!
//! | Job               | Default period | Work                                              |
//! |-------------------|----------------|---------------------------------------------------|
//! | cache sweep       | 5 min          | drop expired cache entries, purge closed windows  |
//! | health sweep      | 60 s           | reset stale error counts, run due recoveries      |
//! | adaptive analysis | 30 min         | log per-service cache analysis                    |
//! | cleanup           | 1 h            | prune monitor events/alerts, error log, idle keys |
//!
//! Each job is its own task and stops when the shared token is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::MaintenanceConfig;
use crate::gateway::Gateway;

/// Usage stats idle longer than this are dropped
const ADAPTIVE_IDLE_MS: u64 = 7 * 24 * 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    CacheSweep,
    HealthSweep,
    AdaptiveAnalysis,
    Cleanup,
}

impl Job {
    pub const ALL: [Job; 4] = [
        Job::CacheSweep,
        Job::HealthSweep,
        Job::AdaptiveAnalysis,
        Job::Cleanup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Job::CacheSweep => "cache_sweep",
            Job::HealthSweep => "health_sweep",
            Job::AdaptiveAnalysis => "adaptive_analysis",
            Job::Cleanup => "cleanup",
        }
    }

    pub fn period(&self, config: &MaintenanceConfig) -> Duration {
        let secs = match self {
            Job::CacheSweep => config.cache_sweep_secs,
            Job::HealthSweep => config.health_sweep_secs,
            Job::AdaptiveAnalysis => config.adaptive_analysis_secs,
            Job::Cleanup => config.cleanup_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

pub struct Maintenance {
    gateway: Arc<Gateway>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(gateway: Arc<Gateway>, config: MaintenanceConfig) -> Arc<Self> {
        Arc::new(Self { gateway, config })
    }

    /// Start one task per job
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        Job::ALL
            .into_iter()
            .map(|job| {
                let this = Arc::clone(self);
                let token = token.clone();
                tokio::spawn(async move { this.run(job, token).await })
            })
            .collect()
    }

    #[instrument(skip(self, token), fields(job = job.name()))]
    async fn run(&self, job: Job, token: CancellationToken) {
        let period = job.period(&self.config);
        info!(period_secs = period.as_secs(), "Starting maintenance job");

        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Maintenance job shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.run_once(job).await;
                }
            }
        }
    }

    /// Execute a single pass of `job`
    pub async fn run_once(&self, job: Job) {
        let gw = &self.gateway;
        match job {
            Job::CacheSweep => {
                match gw.cache().sweep().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "Swept expired cache entries"),
                    Err(e) => warn!(error = %e, "Cache sweep failed"),
                }
                match gw.limiter().purge().await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "Purged closed rate limit windows"),
                    Err(e) => warn!(error = %e, "Rate limit purge failed"),
                }
            }
            Job::HealthSweep => {
                let sweep = gw.health().cleanup();
                if !sweep.recovered.is_empty() || !sweep.errors_reset.is_empty() {
                    info!(
                        recovered = ?sweep.recovered,
                        errors_reset = ?sweep.errors_reset,
                        "Health sweep"
                    );
                }
            }
            Job::AdaptiveAnalysis => {
                if let Some(adaptive) = gw.cache().adaptive() {
                    adaptive.analyze_all();
                }
            }
            Job::Cleanup => {
                let monitor = gw.monitor().cleanup();
                let errors = gw.errors().cleanup();
                let idle = gw
                    .cache()
                    .adaptive()
                    .map(|a| a.prune_idle(gw.clock().now_ms(), ADAPTIVE_IDLE_MS))
                    .unwrap_or(0);
                debug!(
                    events = monitor.events_pruned,
                    alerts = monitor.alerts_pruned,
                    errors,
                    idle_keys = idle,
                    "Cleanup finished"
                );
            }
        }
    }
}
