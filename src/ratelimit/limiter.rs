//! Fixed-window admission control

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::store::{CounterStore, InMemoryCounterStore};
use crate::clock::SharedClock;
use crate::config::{RateLimitConfig, ResolvedConfig};
use crate::error::{Error, Result};

/// Stable identity of a caller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientId {
    /// Caller presented an API key
    ApiKey(String),
    /// Network address (or `unknown`)
    Address(String),
}

impl ClientId {
    /// API key when present and non-empty, otherwise the address
    pub fn from_parts(api_key: Option<&str>, address: Option<&str>) -> Self {
        match api_key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => ClientId::ApiKey(key.to_string()),
            None => ClientId::Address(
                address
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .unwrap_or("unknown")
                    .to_string(),
            ),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ClientId::ApiKey(k) => k,
            ClientId::Address(a) => a,
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    /// Window capacity
    pub limit: u32,
    /// Requests left in the window
    pub remaining: u32,
    /// Epoch ms at which the window rolls over
    pub reset_at_ms: u64,
    /// The counter store failed and the request was let through
    pub fail_open: bool,
}

impl Decision {
    /// Whole seconds until the window rolls over, rounded up
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000)
    }
}

/// Header set a rejected (or admitted) response carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_ms: u64,
    /// Only set on rejection
    pub retry_after_secs: Option<u64>,
}

impl RateLimitHeaders {
    pub fn from_decision(decision: &Decision, now_ms: u64) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_ms: decision.reset_at_ms,
            retry_after_secs: (!decision.allowed).then(|| decision.retry_after_secs(now_ms)),
        }
    }

    /// `(name, value)` pairs in emission order
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_ms.to_string()),
        ];
        if let Some(secs) = self.retry_after_secs {
            pairs.push(("Retry-After", secs.to_string()));
        }
        pairs
    }
}

/// Decision counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub allowed: u64,
    pub rejected: u64,
    pub fail_open: u64,
}

/// Fixed-window rate limiter keyed by (service, client)
pub struct RateLimiter {
    default: RateLimitConfig,
    services: HashMap<String, RateLimitConfig>,
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
    timeout: Duration,
    allowed: AtomicU64,
    rejected: AtomicU64,
    fail_open: AtomicU64,
}

impl RateLimiter {
    pub fn new(
        default: RateLimitConfig,
        services: HashMap<String, RateLimitConfig>,
        store: Arc<dyn CounterStore>,
        clock: SharedClock,
        timeout: Duration,
    ) -> Self {
        Self {
            default,
            services,
            store,
            clock,
            timeout,
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            fail_open: AtomicU64::new(0),
        }
    }

    /// Limiter over in-process counters
    pub fn in_memory(
        default: RateLimitConfig,
        services: HashMap<String, RateLimitConfig>,
        clock: SharedClock,
        timeout: Duration,
    ) -> Self {
        Self::new(default, services, Arc::new(InMemoryCounterStore::new()), clock, timeout)
    }

    /// Limiter with every configured service table
    pub fn from_config(
        config: &ResolvedConfig,
        store: Arc<dyn CounterStore>,
        clock: SharedClock,
    ) -> Self {
        let services = config
            .services
            .values()
            .map(|s| (s.name.clone(), s.rate_limit.clone()))
            .collect();
        Self::new(
            config.default_rate_limit.clone(),
            services,
            store,
            clock,
            config.backend.timeout(),
        )
    }

    /// Table applied to `service`; unconfigured services get the default
    pub fn config(&self, service: &str) -> &RateLimitConfig {
        self.services.get(service).unwrap_or(&self.default)
    }

    /// Counter key for a caller of a service
    pub fn key(&self, client: &ClientId, service: &str) -> String {
        format!("{}{}:{}", self.config(service).key_prefix, service, client)
    }

    /// Count one request and decide whether to admit it
    pub async fn check(&self, client: &ClientId, service: &str) -> Decision {
        self.check_with_deadline(client, service, self.timeout).await
    }

    /// [`check`](Self::check) with an explicit deadline for the counter store
    pub async fn check_with_deadline(
        &self,
        client: &ClientId,
        service: &str,
        deadline: Duration,
    ) -> Decision {
        let config = self.config(service);
        let key = self.key(client, service);
        let now = self.clock.now_ms();
        let window_ms = config.window_ms.max(1);
        let window_start = now / window_ms * window_ms;
        let reset_at_ms = window_start + window_ms;

        let counted = match tokio::time::timeout(
            deadline,
            self.store.increment(&key, window_start, window_ms),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::BackendTimeout {
                timeout_ms: deadline.as_millis() as u64,
            }),
        };

        match counted {
            Ok(count) => {
                let allowed = count <= u64::from(config.max_requests);
                let remaining = u64::from(config.max_requests).saturating_sub(count) as u32;
                if allowed {
                    self.allowed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    debug!(service = %service, client = %client, count, "Rate limit exceeded");
                }
                Decision {
                    allowed,
                    limit: config.max_requests,
                    remaining,
                    reset_at_ms,
                    fail_open: false,
                }
            }
            Err(e) => {
                self.fail_open.fetch_add(1, Ordering::Relaxed);
                warn!(
                    service = %service,
                    store = self.store.name(),
                    error = %e,
                    "Rate limit check failed, admitting request"
                );
                Decision {
                    allowed: true,
                    limit: config.max_requests,
                    remaining: 0,
                    reset_at_ms: now + window_ms,
                    fail_open: true,
                }
            }
        }
    }

    /// Drop counters of closed windows
    pub async fn purge(&self) -> Result<usize> {
        self.store.purge_expired(self.clock.now_ms()).await
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use proptest::prelude::*;

    fn limiter(max: u32, window_ms: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = RateLimitConfig {
            max_requests: max,
            window_ms,
            ..Default::default()
        };
        let limiter = RateLimiter::in_memory(
            RateLimitConfig::default(),
            HashMap::from([("weather".to_string(), config)]),
            clock.clone(),
            Duration::from_millis(250),
        );
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_fourth_request_rejected() {
        let (limiter, _) = limiter(3, 1000);
        let client = ClientId::from_parts(None, Some("10.0.0.1"));

        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(limiter.check(&client, "weather").await.allowed);
        }
        assert_eq!(results, vec![true, true, true, false]);

        let stats = limiter.stats();
        assert_eq!(stats.allowed, 3);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_remaining_and_reset() {
        let (limiter, clock) = limiter(3, 1000);
        clock.set(1_000_250);
        let client = ClientId::from_parts(Some("key-1"), None);

        let first = limiter.check(&client, "weather").await;
        assert_eq!(first.remaining, 2);
        assert_eq!(first.limit, 3);
        assert_eq!(first.reset_at_ms, 1_001_000);
        assert_eq!(first.retry_after_secs(1_000_250), 1);
    }

    #[tokio::test]
    async fn test_window_rollover() {
        let (limiter, clock) = limiter(1, 1000);
        let client = ClientId::from_parts(None, Some("10.0.0.1"));

        assert!(limiter.check(&client, "weather").await.allowed);
        assert!(!limiter.check(&client, "weather").await.allowed);
        clock.advance(Duration::from_millis(1000));
        assert!(limiter.check(&client, "weather").await.allowed);
    }

    #[tokio::test]
    async fn test_clients_and_services_are_isolated() {
        let (limiter, _) = limiter(1, 1000);
        let a = ClientId::from_parts(Some("a"), None);
        let b = ClientId::from_parts(Some("b"), None);

        assert!(limiter.check(&a, "weather").await.allowed);
        assert!(limiter.check(&b, "weather").await.allowed);
        assert!(!limiter.check(&a, "weather").await.allowed);
        // `news` falls back to the 50-request default
        assert!(limiter.check(&a, "news").await.allowed);
        assert_eq!(limiter.config("news").max_requests, 50);
    }

    #[test]
    fn test_client_identity() {
        assert_eq!(
            ClientId::from_parts(Some("k"), Some("1.2.3.4")),
            ClientId::ApiKey("k".into())
        );
        assert_eq!(
            ClientId::from_parts(Some(""), Some("1.2.3.4")),
            ClientId::Address("1.2.3.4".into())
        );
        assert_eq!(ClientId::from_parts(None, None).as_str(), "unknown");
    }

    #[test]
    fn test_key_layout() {
        let (limiter, _) = limiter(1, 1000);
        let client = ClientId::from_parts(None, Some("1.2.3.4"));
        assert_eq!(limiter.key(&client, "weather"), "ratelimit:weather:1.2.3.4");
    }

    #[test]
    fn test_headers() {
        let decision = Decision {
            allowed: false,
            limit: 30,
            remaining: 0,
            reset_at_ms: 61_000,
            fail_open: false,
        };
        let headers = RateLimitHeaders::from_decision(&decision, 59_500);
        assert_eq!(
            headers.pairs(),
            vec![
                ("X-RateLimit-Limit", "30".to_string()),
                ("X-RateLimit-Remaining", "0".to_string()),
                ("X-RateLimit-Reset", "61000".to_string()),
                ("Retry-After", "2".to_string()),
            ]
        );

        let admitted = Decision { allowed: true, ..decision };
        assert!(RateLimitHeaders::from_decision(&admitted, 59_500)
            .retry_after_secs
            .is_none());
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn increment(&self, _: &str, _: u64, _: u64) -> Result<u64> {
            Err(Error::RateLimitBackend("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn test_fails_open() {
        let clock = Arc::new(ManualClock::new(5_000));
        let limiter = RateLimiter::new(
            RateLimitConfig::default(),
            HashMap::new(),
            Arc::new(BrokenStore),
            clock,
            Duration::from_millis(250),
        );
        let decision = limiter
            .check(&ClientId::from_parts(None, Some("1.2.3.4")), "weather")
            .await;

        assert!(decision.allowed);
        assert!(decision.fail_open);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at_ms, 65_000);
        assert_eq!(limiter.stats().fail_open, 1);
    }

    proptest! {
        #[test]
        fn prop_first_n_admitted(
            max in 1u32..40,
            window_ms in 100u64..10_000,
            window_index in 1u64..1_000,
            offsets in proptest::collection::vec(0u64..10_000, 1..60),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let (limiter, clock) = limiter(max, window_ms);
                let client = ClientId::from_parts(Some("prop"), None);
                let window_start = window_index * window_ms;

                let mut offsets: Vec<u64> = offsets.into_iter().map(|o| o % window_ms).collect();
                offsets.sort_unstable();

                for (i, offset) in offsets.iter().enumerate() {
                    let now = window_start + offset;
                    clock.set(now);
                    let decision = limiter.check(&client, "weather").await;
                    prop_assert_eq!(decision.allowed, (i as u32) < max);
                    prop_assert!(decision.reset_at_ms >= now);
                    prop_assert!(decision.reset_at_ms <= now + window_ms);
                }
                Ok(())
            })?;
        }
    }
}
