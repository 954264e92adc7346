//! Request pipeline
//!
//! Wires the components together for one provider call:
//!
//! ```text
//! admit ──► RateLimiter
//!
//! fetch ──► CacheStore::get ──hit──► ApiMonitor::record ──► Cached
//!              │ miss
//!              ▼
//!           HealthMonitor gate ──not healthy──► Degraded (retry hint)
//!              │ healthy
//!              ▼
//!           loader (RetryPolicy) ──ok──► CacheStore::set ─► ApiMonitor::record ─► Fresh
//!              │ err
//!              ▼
//!           ApiMonitor::record ─► HealthMonitor::record_error ─► ErrorLog ─► Failed
//! ```
//!
//! Building the reduced response for a degraded service, and the HTTP
//! status codes, are left to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::cache::CacheStore;
use crate::clock::SharedClock;
use crate::config::ResolvedConfig;
use crate::error::{Error, Result};
use crate::error_log::{ErrorContext, ErrorLog, Severity, UpstreamError};
use crate::health::{ErrorKind, HealthMonitor, ServiceHealth};
use crate::monitor::{ApiEvent, ApiMonitor};
use crate::ratelimit::{ClientId, Decision, RateLimiter};
use crate::retry::RetryPolicy;

/// Payload produced by an upstream loader
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub body: Bytes,
    pub status: u16,
    /// Whether the payload may be cached
    pub cacheable: bool,
}

impl Loaded {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            status: 200,
            cacheable: true,
        }
    }

    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// A loader failure after retries, as recorded
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamFailure {
    pub error: UpstreamError,
    /// Id in the error log
    pub error_id: String,
    /// Health of the service after the failure was recorded
    pub health: ServiceHealth,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Served from cache
    Cached(Bytes),
    /// Loaded from upstream
    Fresh(Bytes),
    /// The service is not healthy; the upstream was not called
    Degraded {
        health: ServiceHealth,
        retry_after_ms: Option<u64>,
    },
    Failed(UpstreamFailure),
}

impl FetchOutcome {
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            FetchOutcome::Cached(body) | FetchOutcome::Fresh(body) => Some(body),
            _ => None,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, FetchOutcome::Cached(_))
    }
}

/// All components of one process
pub struct Gateway {
    cache: Arc<CacheStore>,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthMonitor>,
    monitor: Arc<ApiMonitor>,
    errors: Arc<ErrorLog>,
    retry: RetryPolicy,
    clock: SharedClock,
}

impl Gateway {
    pub fn new(
        cache: Arc<CacheStore>,
        limiter: Arc<RateLimiter>,
        health: Arc<HealthMonitor>,
        monitor: Arc<ApiMonitor>,
        errors: Arc<ErrorLog>,
        retry: RetryPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            cache,
            limiter,
            health,
            monitor,
            errors,
            retry,
            clock,
        }
    }

    /// Everything in-process
    pub fn in_memory(config: &ResolvedConfig, clock: SharedClock) -> Self {
        let cache = CacheStore::in_memory(config.cache_tables(), &config.backend, clock.clone());
        let limiter = RateLimiter::in_memory(
            config.default_rate_limit.clone(),
            config
                .services
                .values()
                .map(|s| (s.name.clone(), s.rate_limit.clone()))
                .collect::<HashMap<_, _>>(),
            clock.clone(),
            config.backend.timeout(),
        );
        Self::from_parts(config, cache, limiter, clock)
    }

    /// Build the stateless components from `config` around the given stores
    pub fn from_parts(
        config: &ResolvedConfig,
        cache: CacheStore,
        limiter: RateLimiter,
        clock: SharedClock,
    ) -> Self {
        Self::new(
            Arc::new(cache),
            Arc::new(limiter),
            Arc::new(HealthMonitor::from_config(config, clock.clone())),
            Arc::new(ApiMonitor::from_config(config, clock.clone())),
            Arc::new(ErrorLog::new(clock.clone())),
            config.retry.clone(),
            clock,
        )
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn monitor(&self) -> &Arc<ApiMonitor> {
        &self.monitor
    }

    pub fn errors(&self) -> &Arc<ErrorLog> {
        &self.errors
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Rate limit decision for one inbound request
    pub async fn admit(&self, client: &ClientId, service: &str) -> Decision {
        let decision = self.limiter.check(client, service).await;
        if decision.fail_open {
            let err = UpstreamError::new(
                ErrorKind::Storage,
                "RATE_LIMIT_BACKEND_UNAVAILABLE",
                "rate limit counter store unreachable, request admitted",
            )
            .with_service(service)
            .with_severity(Severity::Medium);
            self.errors.log(&err, ErrorContext::default());
        }
        decision
    }

    /// Serve `(service, params)` from cache or through `loader`
    pub async fn fetch<F, Fut>(&self, service: &str, params: &Value, loader: F) -> Result<FetchOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Loaded, UpstreamError>>,
    {
        self.fetch_with_context(service, params, ErrorContext::default(), loader)
            .await
    }

    /// [`fetch`](Self::fetch) with request details for the error log.
    ///
    /// Fails only for a service that was never registered.
    #[instrument(skip(self, params, context, loader), fields(service = %service))]
    pub async fn fetch_with_context<F, Fut>(
        &self,
        service: &str,
        params: &Value,
        context: ErrorContext,
        loader: F,
    ) -> Result<FetchOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Loaded, UpstreamError>>,
    {
        if !self.health.is_registered(service) {
            return Err(Error::UnknownService(service.to_string()));
        }
        let endpoint = format!("/api/{}", service);
        let started = Instant::now();

        if let Some(body) = self.cache.get(service, params).await {
            self.monitor.record(
                ApiEvent::new(service, &endpoint, 200, elapsed_ms(started), self.clock.now_ms())
                    .with_cache_hit(true),
            );
            return Ok(FetchOutcome::Cached(body));
        }

        let mut health = self.health.health(service)?;
        if !health.is_healthy() && self.health.attempt_recovery(service)? {
            health = ServiceHealth::Healthy;
        }
        if !health.is_healthy() {
            let retry_after_ms = self.health.retry_after_ms(service);
            debug!(health = %health, ?retry_after_ms, "Skipping upstream call");
            return Ok(FetchOutcome::Degraded {
                health,
                retry_after_ms,
            });
        }

        match self.retry.retry(loader).await {
            Ok(loaded) => {
                if loaded.cacheable {
                    self.cache.set(service, params, &loaded.body).await;
                }
                self.monitor.record(ApiEvent::new(
                    service,
                    &endpoint,
                    loaded.status,
                    elapsed_ms(started),
                    self.clock.now_ms(),
                ));
                Ok(FetchOutcome::Fresh(loaded.body))
            }
            Err(mut error) => {
                let status = error.status.unwrap_or_else(|| error.kind.http_status());
                self.monitor.record(
                    ApiEvent::new(service, &endpoint, status, elapsed_ms(started), self.clock.now_ms())
                        .with_error(error.message.clone()),
                );
                let health = self.health.record_error(service, error.kind)?;
                if error.service.is_none() {
                    error.service = Some(service.to_string());
                }
                let error_id = self.errors.log(&error, context);
                Ok(FetchOutcome::Failed(UpstreamFailure {
                    error,
                    error_id,
                    health,
                    status,
                }))
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RelayConfig;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn gateway() -> (Gateway, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = RelayConfig::builtin().resolve().unwrap();
        let gateway = Gateway::in_memory(&config, clock.clone()).with_retry(RetryPolicy::none());
        (gateway, clock)
    }

    fn bad_gateway() -> UpstreamError {
        UpstreamError::new(ErrorKind::ExternalApi, "PROVIDER_DOWN", "provider returned 502")
            .with_status(502)
    }

    #[tokio::test]
    async fn test_cache_hit_skips_loader() {
        let (gw, _) = gateway();
        let calls = AtomicU32::new(0);
        let params = json!({"city": "Lagos"});

        for _ in 0..2 {
            gw.fetch("weather", &params, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(Loaded::new(&b"sunny"[..])) }
            })
            .await
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let outcome = gw
            .fetch("weather", &params, || async { Ok(Loaded::new(&b"rain"[..])) })
            .await
            .unwrap();
        assert!(outcome.is_cached());
        assert_eq!(outcome.body().unwrap().as_ref(), b"sunny");

        let stats = gw.monitor().service_stats("weather");
        assert_eq!(stats.total_requests, 3);
        assert!((stats.cache_hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_uncacheable_payload_not_stored() {
        let (gw, _) = gateway();
        let params = json!({"city": "Abuja"});
        let outcome = gw
            .fetch("weather", &params, || async {
                Ok(Loaded::new(&b"partial"[..]).uncacheable())
            })
            .await
            .unwrap();
        assert_matches!(outcome, FetchOutcome::Fresh(_));
        assert!(gw.cache().get("weather", &params).await.is_none());
    }

    #[tokio::test]
    async fn test_failures_degrade_then_recover() {
        let (gw, clock) = gateway();
        let params = json!({"symbol": "AAPL"});

        for _ in 0..5 {
            let outcome = gw
                .fetch("stock", &params, || async { Err(bad_gateway()) })
                .await
                .unwrap();
            assert_matches!(outcome, FetchOutcome::Failed(UpstreamFailure { status: 502, .. }));
        }
        assert_eq!(gw.health().health("stock").unwrap(), ServiceHealth::Degraded);
        assert_eq!(gw.errors().len(), 5);

        let calls = AtomicU32::new(0);
        let outcome = gw
            .fetch("stock", &params, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(Loaded::new(&b"189.2"[..])) }
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Degraded {
                health: ServiceHealth::Degraded,
                retry_after_ms: Some(60_000),
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(60));
        let outcome = gw
            .fetch("stock", &params, || async { Ok(Loaded::new(&b"189.2"[..])) })
            .await
            .unwrap();
        assert_matches!(outcome, FetchOutcome::Fresh(_));
        assert_eq!(gw.health().health("stock").unwrap(), ServiceHealth::Healthy);
    }

    #[tokio::test]
    async fn test_no_fallback_goes_unavailable() {
        let (gw, _) = gateway();
        let params = json!({"text": "hello"});
        let outcome = gw
            .fetch("qrcode", &params, || async {
                Err(UpstreamError::new(ErrorKind::Server, "RENDER_FAILED", "renderer crashed"))
            })
            .await
            .unwrap();
        assert_matches!(
            outcome,
            FetchOutcome::Failed(UpstreamFailure {
                health: ServiceHealth::Unavailable,
                status: 500,
                ..
            })
        );

        let outcome = gw
            .fetch("qrcode", &params, || async { Ok(Loaded::new(&b"png"[..])) })
            .await
            .unwrap();
        assert_matches!(
            outcome,
            FetchOutcome::Degraded {
                health: ServiceHealth::Unavailable,
                ..
            }
        );
    }

    #[tokio::test]
    async fn test_failure_is_logged_with_service() {
        let (gw, _) = gateway();
        let outcome = gw
            .fetch("news", &json!({"topic": "tech"}), || async { Err(bad_gateway()) })
            .await
            .unwrap();
        let FetchOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        let record = gw.errors().get(&failure.error_id).unwrap();
        assert_eq!(record.service.as_deref(), Some("news"));
        assert_eq!(record.kind, ErrorKind::ExternalApi);
        assert!(!gw.monitor().active_alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried() {
        let clock = Arc::new(ManualClock::default());
        let config = RelayConfig::builtin().resolve().unwrap();
        let gw = Gateway::in_memory(&config, clock);
        let calls = AtomicU32::new(0);

        let outcome = gw
            .fetch("currency", &json!({"from": "USD", "to": "NGN"}), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(UpstreamError::new(ErrorKind::Timeout, "TIMEOUT", "timed out"))
                    } else {
                        Ok(Loaded::new(&b"1550.0"[..]))
                    }
                }
            })
            .await
            .unwrap();
        assert_matches!(outcome, FetchOutcome::Fresh(_));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(gw.errors().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let (gw, _) = gateway();
        let result = gw
            .fetch("horoscope", &json!({}), || async { Ok(Loaded::new(&b"x"[..])) })
            .await;
        assert_matches!(result, Err(Error::UnknownService(_)));
    }

    #[tokio::test]
    async fn test_admit() {
        let (gw, _) = gateway();
        let client = ClientId::from_parts(None, Some("10.0.0.1"));
        for _ in 0..30 {
            assert!(gw.admit(&client, "weather").await.allowed);
        }
        let decision = gw.admit(&client, "weather").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }
}
