//! Bounded retry with exponential backoff and jitter for narrative calls.

use std::future::Future;
use std::time::Duration;

use rand_distr::{Distribution, Uniform};

use crate::config::RetryConfig;
use crate::error::EscalationError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomised either way, in [0, 1].
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base = self
            .base_delay_ms
            .saturating_mul(exponent)
            .min(self.max_delay_ms) as f64;

        let factor = if self.jitter > 0.0 {
            Uniform::new_inclusive(1.0 - self.jitter, 1.0 + self.jitter)
                .map(|dist| dist.sample(&mut rand::rng()))
                .unwrap_or(1.0)
        } else {
            1.0
        };
        Duration::from_millis((base * factor).round().min(self.max_delay_ms as f64) as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. The last error is returned.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, EscalationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EscalationError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "Escalation: {} retry {}/{} after {} (sleep {:?})",
                        label,
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.25,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 400,
            max_delay_ms: 10_000,
            jitter: 0.25,
        };
        for _ in 0..50 {
            let ms = policy.delay_for(1).as_millis();
            assert!((300..=500).contains(&ms), "delay {}ms out of band", ms);
        }
    }

    #[tokio::test]
    async fn test_retries_retryable_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(EscalationError::Rejected { status: 503, body: String::new() })
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.expect("eventually ok"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EscalationError::Rejected { status: 400, body: "bad".into() })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(2)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EscalationError::Network("reset".into()))
            })
            .await;
        assert!(matches!(result, Err(EscalationError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
