//! Per-source token buckets shared by every worker of a cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

// Absorbs float rounding in refill math so a fully refilled token is not
// missed by a few ulps.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TokenBucketConfig {
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    1
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2.5,
            burst: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LimitError {
    #[error("no token became available within {waited:?}")]
    Timeout { waited: Duration },
}

#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let capacity = f64::from(config.burst.max(1));
        Self {
            rate_per_sec: config.requests_per_second.max(f64::MIN_POSITIVE),
            capacity,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut TokenBucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Takes a token without waiting.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        if state.tokens + TOKEN_EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// Waits for a token. With a deadline, gives up once the deadline has
    /// passed without a token and returns how long it waited.
    pub async fn acquire(&self, deadline: Option<Instant>) -> Result<Duration, LimitError> {
        let started = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);
                if state.tokens + TOKEN_EPSILON >= 1.0 {
                    state.tokens = (state.tokens - 1.0).max(0.0);
                    return Ok(now.saturating_duration_since(started));
                }
                Duration::try_from_secs_f64((1.0 - state.tokens) / self.rate_per_sec)
                    .unwrap_or(Duration::MAX)
            };

            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    return Err(LimitError::Timeout {
                        waited: started.elapsed(),
                    });
                }
                Some(deadline)
                    if Instant::now().checked_add(wait).map_or(true, |ready| ready > deadline) =>
                {
                    tokio::time::sleep_until(deadline).await;
                }
                _ => tokio::time::sleep(wait).await,
            }
        }
    }
}

/// Token buckets keyed by source id. Sources without an explicit
/// configuration get a bucket built from the default configuration, or are
/// unlimited when there is none.
#[derive(Debug, Default)]
pub struct RateLimiter {
    configs: HashMap<String, TokenBucketConfig>,
    default_config: Option<TokenBucketConfig>,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(default_config: Option<TokenBucketConfig>) -> Self {
        Self {
            configs: HashMap::new(),
            default_config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>, config: TokenBucketConfig) -> Self {
        self.configs.insert(source_id.into(), config);
        self
    }

    pub async fn bucket_for(&self, source_id: &str) -> Option<Arc<TokenBucket>> {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get(source_id) {
            return Some(bucket.clone());
        }
        let config = self.configs.get(source_id).copied().or(self.default_config)?;
        let bucket = Arc::new(TokenBucket::new(config));
        buckets.insert(source_id.to_string(), bucket.clone());
        Some(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn throughput_is_bounded_by_rate_after_burst() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            requests_per_second: 4.0,
            burst: 2,
        });
        let started = Instant::now();
        for _ in 0..10 {
            bucket.acquire(None).await.expect("token");
        }
        let elapsed = started.elapsed();
        // (N - burst) / R = 8 / 4 = 2s
        assert!(elapsed >= Duration::from_millis(1990), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2100), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_at_deadline() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            requests_per_second: 0.1,
            burst: 1,
        });
        assert!(bucket.try_acquire().await);

        let deadline = Instant::now() + Duration::from_secs(1);
        let err = bucket.acquire(Some(deadline)).await.unwrap_err();
        let LimitError::Timeout { waited } = err;
        assert!(waited >= Duration::from_millis(999));
        assert!(Instant::now() <= deadline + Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn vanishingly_small_rates_wait_until_the_deadline() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            requests_per_second: 1e-30,
            burst: 1,
        });
        assert!(bucket.try_acquire().await);

        let deadline = Instant::now() + Duration::from_millis(250);
        let err = bucket.acquire(Some(deadline)).await.unwrap_err();
        assert!(matches!(err, LimitError::Timeout { .. }));
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test]
    async fn unconfigured_sources_are_unlimited_without_default() {
        let limiter = RateLimiter::new(None).with_source("crunchbase", TokenBucketConfig::default());
        assert!(limiter.bucket_for("crunchbase").await.is_some());
        assert!(limiter.bucket_for("linkedin").await.is_none());

        let a = limiter.bucket_for("crunchbase").await.unwrap();
        let b = limiter.bucket_for("crunchbase").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
