//! Upstream retry policy
//!
//! Exponential backoff with additive jitter for transient upstream
//! failures. Only status codes in the policy list and the timeout and
//! network kinds are retried; everything else fails on the first attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error_log::UpstreamError;
use crate::health::ErrorKind;

/// What the policy needs to know about a failed attempt
pub trait RetryOutcome {
    fn status(&self) -> Option<u16>;
    fn kind(&self) -> ErrorKind;
}

impl RetryOutcome for UpstreamError {
    fn status(&self) -> Option<u16> {
        self.status
    }

    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    /// Jitter added on top of the delay, as a fraction of it
    pub jitter_ratio: f64,
    pub retry_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 300,
            max_delay_ms: 3000,
            factor: 2.0,
            jitter_ratio: 0.3,
            retry_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt + 1` (`attempt` is zero-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.factor.powi(attempt.min(32) as i32);
        let jitter_max = base * self.jitter_ratio.max(0.0);
        let jitter = if jitter_max > 0.0 {
            rand::thread_rng().gen_range(0.0..jitter_max)
        } else {
            0.0
        };
        let delay = (base + jitter).min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }

    pub fn should_retry<E: RetryOutcome + ?Sized>(&self, outcome: &E) -> bool {
        if let Some(status) = outcome.status() {
            if self.retry_status_codes.contains(&status) {
                return true;
            }
        }
        matches!(outcome.kind(), ErrorKind::Timeout | ErrorKind::Network)
    }

    /// Run `op` until it succeeds, fails for good, or retries run out.
    /// The last error is returned unchanged.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryOutcome + Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries && self.should_retry(&e) => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upstream call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn failure(kind: ErrorKind, status: Option<u16>) -> UpstreamError {
        let mut e = UpstreamError::new(kind, "UPSTREAM", "failed");
        e.status = status;
        e
    }

    #[test]
    fn test_backoff_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let first = policy.backoff(0).as_millis() as u64;
            assert!((300..390).contains(&first), "first = {}", first);
            let second = policy.backoff(1).as_millis() as u64;
            assert!((600..780).contains(&second), "second = {}", second);
            assert_eq!(policy.backoff(4).as_millis(), 3000);
        }
    }

    #[test]
    fn test_backoff_without_jitter() {
        let policy = RetryPolicy {
            jitter_ratio: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(300));
        assert_eq!(policy.backoff(2), Duration::from_millis(1200));
        assert_eq!(policy.backoff(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&failure(ErrorKind::ExternalApi, Some(503))));
        assert!(policy.should_retry(&failure(ErrorKind::RateLimit, Some(429))));
        assert!(policy.should_retry(&failure(ErrorKind::Timeout, None)));
        assert!(policy.should_retry(&failure(ErrorKind::Network, None)));

        assert!(!policy.should_retry(&failure(ErrorKind::Validation, Some(400))));
        assert!(!policy.should_retry(&failure(ErrorKind::NotFound, Some(404))));
        assert!(!policy.should_retry(&failure(ErrorKind::ExternalApi, None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = RetryPolicy::default()
            .retry(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(failure(ErrorKind::Timeout, Some(408)))
                    } else {
                        Ok("payload")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "payload");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = RetryPolicy::default()
            .retry(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(failure(ErrorKind::ExternalApi, Some(502)))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().status, Some(502));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_on_client_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = RetryPolicy::default()
            .retry(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(failure(ErrorKind::Validation, Some(400)))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
