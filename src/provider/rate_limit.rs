//! Provider rate limiter (spec.md §4.3 "rate limiting"): a token bucket
//! shared across all provider calls, grounded on the sliding-window counter
//! in the backend's `middleware/rate_limit.rs` but adapted to an async
//! wait-for-token model since provider calls are awaited, not rejected.

use super::{Provider, ProviderMode};
use crate::domain::{ExpiryRule, Instrument, Quote};
use crate::error::{ProviderError, ProviderErrorKind};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Shared token-bucket limiter: `rate` tokens/second, up to `burst` banked.
/// A caller that cannot get a token within `max_wait` fails with
/// `ProviderErrorKind::RateLimit` rather than blocking indefinitely
/// (spec.md §4.3 "on exhaustion, caller blocks up to bounded wait then
/// fails `rate_limit`").
#[derive(Clone)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    max_wait: Duration,
    state: Arc<Mutex<BucketState>>,
    metrics: Arc<crate::metrics::Registry>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: f64, max_wait: Duration, metrics: Arc<crate::metrics::Registry>) -> Self {
        Self {
            rate: rate_per_sec,
            burst,
            max_wait,
            state: Arc::new(Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            })),
            metrics,
        }
    }

    /// Waits until a token is available, then consumes it. Records the wait
    /// duration in `g6_rate_limit_wait_seconds`, or fails with `RateLimit`
    /// and bumps `g6_rate_limit_exhausted_total` once `max_wait` elapses.
    pub async fn acquire(&self) -> Result<(), ProviderError> {
        let started = Instant::now();
        let wait = loop {
            let mut state = self.state.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
            state.last_refill = now;

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                break started.elapsed();
            }
            let deficit = 1.0 - state.tokens;
            let wait_secs = deficit / self.rate;
            drop(state);

            let already_waited = started.elapsed();
            if already_waited >= self.max_wait {
                self.metrics.inc("g6_rate_limit_exhausted_total", &[], 1);
                return Err(ProviderError::new(ProviderErrorKind::RateLimit));
            }
            let remaining = self.max_wait - already_waited;
            tokio::time::sleep(Duration::from_secs_f64(wait_secs).min(remaining)).await;
        };
        self.metrics.observe("g6_rate_limit_wait_seconds", &[], wait.as_secs_f64());
        Ok(())
    }
}

/// Wraps a `Provider` so every call acquires a token from the shared
/// limiter first, failing the call with `rate_limit` if the bucket stays
/// empty past the limiter's bounded wait (spec.md §4.3 "Rate limiting").
pub struct RateLimitedProvider<P: Provider> {
    inner: P,
    limiter: RateLimiter,
}

impl<P: Provider> RateLimitedProvider<P> {
    pub fn new(inner: P, limiter: RateLimiter) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl<P: Provider> Provider for RateLimitedProvider<P> {
    async fn get_ltp(&self, symbol: &str) -> Result<f64, ProviderError> {
        self.limiter.acquire().await?;
        self.inner.get_ltp(symbol).await
    }

    async fn get_quote(&self, instrument: &str) -> Result<Quote, ProviderError> {
        self.limiter.acquire().await?;
        self.inner.get_quote(instrument).await
    }

    async fn resolve_expiry(&self, symbol: &str, rule: &ExpiryRule) -> Result<NaiveDate, ProviderError> {
        self.limiter.acquire().await?;
        self.inner.resolve_expiry(symbol, rule).await
    }

    async fn get_option_instruments(
        &self,
        symbol: &str,
        expiry: NaiveDate,
        strikes: &[f64],
    ) -> Result<Vec<Instrument>, ProviderError> {
        self.limiter.acquire().await?;
        self.inner.get_option_instruments(symbol, expiry, strikes).await
    }

    fn mode(&self) -> ProviderMode {
        self.inner.mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Registry;

    #[tokio::test]
    async fn burst_capacity_is_immediately_available() {
        let registry = Arc::new(Registry::new_for_test());
        let limiter = RateLimiter::new(10.0, 3.0, Duration::from_secs(1), registry);
        for _ in 0..3 {
            let start = Instant::now();
            limiter.acquire().await.unwrap();
            assert!(start.elapsed() < Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn exhausted_bucket_fails_with_rate_limit_after_bounded_wait() {
        let registry = Arc::new(Registry::new_for_test());
        let limiter = RateLimiter::new(1.0, 1.0, Duration::from_millis(50), registry);
        limiter.acquire().await.unwrap();
        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::RateLimit);
    }
}
