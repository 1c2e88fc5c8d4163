//! Retry classification and the exponential backoff policy shared by all
//! sources.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Errors that know whether repeating the request could help.
pub trait RetryClassify {
    fn disposition(&self) -> RetryDisposition;
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

/// Serialized form of [`BackoffPolicy`] with millisecond fields.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackoffPolicyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    BackoffPolicy::default().max_attempts
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_jitter() -> f64 {
    0.2
}

impl From<BackoffPolicyConfig> for BackoffPolicy {
    fn from(config: BackoffPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: if config.multiplier.is_finite() && config.multiplier >= 1.0 {
                config.multiplier
            } else {
                1.0
            },
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: if config.jitter.is_finite() {
                config.jitter.clamp(0.0, 1.0)
            } else {
                default_jitter()
            },
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt_index + 1`, without jitter.
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn jittered_delay<R: Rng>(&self, attempt_index: u32, rng: &mut R) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        if !self.jitter.is_finite() || self.jitter <= 0.0 {
            return delay;
        }
        let jitter = self.jitter.min(1.0);
        let factor = rng.random_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = BackoffPolicy {
            jitter: 0.5,
            ..BackoffPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..4 {
            let base = policy.delay_for_attempt(attempt);
            let jittered = policy.jittered_delay(attempt, &mut rng);
            assert!(jittered >= base.mul_f64(0.5));
            assert!(jittered <= base.mul_f64(1.5));
        }
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn config_is_sanitized() {
        let policy = BackoffPolicy::from(BackoffPolicyConfig {
            max_attempts: 0,
            base_delay_ms: 10,
            multiplier: 0.5,
            max_delay_ms: 100,
            jitter: 3.0,
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.multiplier, 1.0);
        assert_eq!(policy.jitter, 1.0);
    }

    #[test]
    fn non_finite_jitter_falls_back_to_default() {
        let config = |jitter| BackoffPolicyConfig {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
            jitter,
        };
        for jitter in [f64::NAN, f64::INFINITY] {
            let policy = BackoffPolicy::from(config(jitter));
            assert_eq!(policy.jitter, default_jitter());
            let delay = policy.jittered_delay(0, &mut StdRng::seed_from_u64(3));
            assert!(delay >= Duration::from_millis(79) && delay <= Duration::from_millis(121));
        }

        let raw = BackoffPolicy {
            jitter: f64::NAN,
            ..BackoffPolicy::from(config(0.0))
        };
        assert_eq!(raw.jittered_delay(1, &mut StdRng::seed_from_u64(3)), Duration::from_millis(200));
    }
}
