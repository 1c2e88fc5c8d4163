//! Rate-limited, retrying wrapper around single external requests.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::limiter::{LimitError, RateLimiter};
use crate::retry::{BackoffPolicy, RetryClassify, RetryDisposition};

#[derive(Debug, Error)]
pub enum CallError<E: std::error::Error + 'static> {
    #[error("rate limit wait for source `{source_id}` timed out after {waited:?}")]
    RateLimitTimeout { source_id: String, waited: Duration },
    #[error("source `{source_id}` unavailable after {attempts} attempt(s): {last_error}")]
    SourceUnavailable {
        source_id: String,
        attempts: u32,
        #[source]
        last_error: E,
    },
    #[error("source `{source_id}` failed without retry: {error}")]
    SourceFatal {
        source_id: String,
        #[source]
        error: E,
    },
    /// The caller's deadline cut a token wait or backoff sleep short.
    #[error("deadline reached for source `{source_id}` after {attempts} attempt(s)")]
    DeadlineReached { source_id: String, attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorKind {
    RateLimitTimeout,
    SourceUnavailable,
    SourceFatal,
    DeadlineReached,
}

impl<E: std::error::Error + 'static> CallError<E> {
    pub fn kind(&self) -> CallErrorKind {
        match self {
            CallError::RateLimitTimeout { .. } => CallErrorKind::RateLimitTimeout,
            CallError::SourceUnavailable { .. } => CallErrorKind::SourceUnavailable,
            CallError::SourceFatal { .. } => CallErrorKind::SourceFatal,
            CallError::DeadlineReached { .. } => CallErrorKind::DeadlineReached,
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            CallError::RateLimitTimeout { source_id, .. }
            | CallError::SourceUnavailable { source_id, .. }
            | CallError::SourceFatal { source_id, .. }
            | CallError::DeadlineReached { source_id, .. } => source_id,
        }
    }
}

/// Applies the per-source token bucket and backoff policy to every request.
/// Each attempt, including retries, consumes one token.
#[derive(Debug)]
pub struct RateLimitedClient {
    limiter: RateLimiter,
    policies: HashMap<String, BackoffPolicy>,
    default_policy: BackoffPolicy,
    acquire_timeout: Option<Duration>,
}

impl RateLimitedClient {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            limiter,
            policies: HashMap::new(),
            default_policy: BackoffPolicy::default(),
            acquire_timeout: None,
        }
    }

    pub fn with_default_policy(mut self, policy: BackoffPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_policy(mut self, source_id: impl Into<String>, policy: BackoffPolicy) -> Self {
        self.policies.insert(source_id.into(), policy);
        self
    }

    /// Default bound on a single token wait.
    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn policy_for(&self, source_id: &str) -> BackoffPolicy {
        self.policies
            .get(source_id)
            .copied()
            .unwrap_or(self.default_policy)
    }

    pub async fn call<T, E, F, Fut>(&self, source_id: &str, op: F) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify + std::error::Error + 'static,
    {
        self.execute(source_id, self.acquire_timeout, None, op).await
    }

    pub async fn call_with_timeout<T, E, F, Fut>(
        &self,
        source_id: &str,
        timeout: Duration,
        op: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify + std::error::Error + 'static,
    {
        self.execute(source_id, Some(timeout), None, op).await
    }

    /// Like [`call`](Self::call), but neither token waits nor backoff sleeps
    /// extend past `deadline`.
    pub async fn call_before<T, E, F, Fut>(
        &self,
        source_id: &str,
        deadline: Option<Instant>,
        op: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify + std::error::Error + 'static,
    {
        self.execute(source_id, self.acquire_timeout, deadline, op).await
    }

    async fn execute<T, E, F, Fut>(
        &self,
        source_id: &str,
        acquire_timeout: Option<Duration>,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify + std::error::Error + 'static,
    {
        let policy = self.policy_for(source_id);
        let bucket = self.limiter.bucket_for(source_id).await;
        let mut attempts = 0u32;

        loop {
            if let Some(bucket) = &bucket {
                let token_deadline = earliest(acquire_timeout.map(|t| Instant::now() + t), deadline);
                if let Err(LimitError::Timeout { waited }) = bucket.acquire(token_deadline).await {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(CallError::DeadlineReached {
                            source_id: source_id.to_string(),
                            attempts,
                        });
                    }
                    return Err(CallError::RateLimitTimeout {
                        source_id: source_id.to_string(),
                        waited,
                    });
                }
            }

            attempts += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.disposition() == RetryDisposition::NonRetryable {
                return Err(CallError::SourceFatal {
                    source_id: source_id.to_string(),
                    error: err,
                });
            }
            if attempts >= policy.max_attempts {
                return Err(CallError::SourceUnavailable {
                    source_id: source_id.to_string(),
                    attempts,
                    last_error: err,
                });
            }

            let delay = policy.jittered_delay(attempts - 1, &mut rand::rng());
            if deadline.is_some_and(|d| Instant::now() + delay > d) {
                debug!(source_id, attempts, error = %err, "backoff would pass the deadline; giving up");
                return Err(CallError::DeadlineReached {
                    source_id: source_id.to_string(),
                    attempts,
                });
            }
            warn!(source_id, attempts, ?delay, error = %err, "transient source failure; retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::TokenBucketConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Error)]
    enum FakeError {
        #[error("flaky")]
        Flaky,
        #[error("denied")]
        Denied,
    }

    impl RetryClassify for FakeError {
        fn disposition(&self) -> RetryDisposition {
            match self {
                FakeError::Flaky => RetryDisposition::Retryable,
                FakeError::Denied => RetryDisposition::NonRetryable,
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let client = RateLimitedClient::new(RateLimiter::new(None)).with_default_policy(fast_policy(4));
        let calls = Arc::new(AtomicU32::new(0));

        let result = client
            .call("crunchbase", || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(FakeError::Flaky)
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_source_unavailable() {
        let client = RateLimitedClient::new(RateLimiter::new(None)).with_default_policy(fast_policy(3));
        let calls = Arc::new(AtomicU32::new(0));

        let err = client
            .call("linkedin", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FakeError::Flaky)
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), CallErrorKind::SourceUnavailable);
        assert!(matches!(err, CallError::SourceUnavailable { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let client = RateLimitedClient::new(RateLimiter::new(None)).with_default_policy(fast_policy(5));
        let calls = Arc::new(AtomicU32::new(0));

        let err = client
            .call("crunchbase", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FakeError::Denied)
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), CallErrorKind::SourceFatal);
        assert_eq!(err.source_id(), "crunchbase");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_times_out() {
        let limiter = RateLimiter::new(None).with_source(
            "crunchbase",
            TokenBucketConfig {
                requests_per_second: 0.01,
                burst: 1,
            },
        );
        let client = RateLimitedClient::new(limiter);

        client
            .call("crunchbase", || async { Ok::<_, FakeError>(()) })
            .await
            .expect("burst token");
        let err = client
            .call_with_timeout("crunchbase", Duration::from_millis(500), || async {
                Ok::<_, FakeError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CallErrorKind::RateLimitTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cut_token_wait_is_not_a_rate_limit_timeout() {
        let limiter = RateLimiter::new(None).with_source(
            "crunchbase",
            TokenBucketConfig {
                requests_per_second: 1.0,
                burst: 1,
            },
        );
        let client = RateLimitedClient::new(limiter).with_acquire_timeout(Some(Duration::from_secs(30)));

        client
            .call("crunchbase", || async { Ok::<_, FakeError>(()) })
            .await
            .expect("burst token");
        let deadline = Instant::now() + Duration::from_millis(300);
        let err = client
            .call_before("crunchbase", Some(deadline), || async { Ok::<_, FakeError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CallErrorKind::DeadlineReached);
        assert!(Instant::now() >= deadline);

        let err = client
            .call_with_timeout("crunchbase", Duration::from_millis(100), || async {
                Ok::<_, FakeError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CallErrorKind::RateLimitTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_past_the_deadline_reports_deadline_reached() {
        let client = RateLimitedClient::new(RateLimiter::new(None)).with_default_policy(fast_policy(5));
        let deadline = Instant::now() + Duration::from_millis(15);

        let err = client
            .call_before("linkedin", Some(deadline), || async { Err::<(), _>(FakeError::Flaky) })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::DeadlineReached { attempts: 2, .. }));
    }
}
