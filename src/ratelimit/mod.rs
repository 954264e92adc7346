//! Rate limiting
//!
//! Fixed-window admission control per (service, client). The window a
//! request falls in is `floor(now / window_ms) * window_ms`; the request is
//! admitted while the window's counter stays at or below `max_requests`.
//!
//! The limiter never blocks or delays: it returns a [`Decision`] and the
//! caller turns a rejection into a `429` using [`RateLimitHeaders`]. When
//! the counter store fails or times out the request is admitted
//! (fail-open) and the failure is logged and counted.

mod limiter;
mod store;

pub use limiter::{ClientId, Decision, RateLimitHeaders, RateLimitStats, RateLimiter};
#[cfg(feature = "redis")]
pub use store::RedisCounterStore;
pub use store::{CounterStore, InMemoryCounterStore};
