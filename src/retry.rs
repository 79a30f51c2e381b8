//! Retry engine with exponential backoff and jitter.
//!
//! Wraps any fallible async operation with a policy
//! `(max_retries, base_delay, multiplier, jitter)`. Only error kinds the
//! taxonomy marks transient are re-attempted; everything else surfaces on
//! the first failure. A rate-limit error carrying `Retry-After` overrides
//! the computed delay verbatim.

use crate::error::HarvestError;
use crate::settings::RetrySettings;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }

    /// Delay before attempt `n` (1-indexed) is retried:
    /// `base * multiplier^(n-1) * (1 + U[0,1) * jitter)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = self.base_delay.as_secs_f64() * exp;
        let jittered = base * (1.0 + rand::thread_rng().gen_range(0.0..1.0) * self.jitter);
        Duration::from_secs_f64(jittered)
    }

    /// Lower bound of the delay for attempt `n` (jitter excluded). Useful
    /// for asserting elapsed time in tests.
    pub fn min_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(self.base_delay.as_secs_f64() * exp)
    }
}

/// Outcome of one wrapped operation, with the number of retries spent.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, HarvestError>,
    pub retries: u32,
    pub rate_limit_hits: u32,
}

/// Run `op` under `policy`. `op` is invoked up to `max_retries + 1` times.
pub async fn run_with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HarvestError>>,
{
    let mut retries = 0;
    let mut rate_limit_hits = 0;

    loop {
        match op().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    retries,
                    rate_limit_hits,
                }
            }
            Err(err) => {
                if !err.is_transient() || retries >= policy.max_retries {
                    if retries > 0 {
                        warn!(
                            error_type = err.kind(),
                            retry_count = retries,
                            "giving up after retries"
                        );
                    }
                    return RetryOutcome {
                        result: Err(err),
                        retries,
                        rate_limit_hits,
                    };
                }

                retries += 1;
                let delay = match err.retry_after() {
                    // Retry-After is authoritative when present.
                    Some(after) => {
                        rate_limit_hits += 1;
                        after
                    }
                    None => {
                        if matches!(err, HarvestError::RateLimit { .. }) {
                            rate_limit_hits += 1;
                        }
                        policy.delay_for_attempt(retries)
                    }
                };
                debug!(
                    error_type = err.kind(),
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn delays_grow_exponentially() {
        let p = policy(5, 100);
        assert_eq!(p.min_delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.min_delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(p.min_delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_bounds_delay() {
        let p = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.5,
        };
        for _ in 0..32 {
            let d = p.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        tokio::time::pause();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();
        let outcome = run_with_retry(&policy(5, 10), move || {
            let calls = calls_op.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HarvestError::Timeout("slow".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_surface_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();
        let outcome: RetryOutcome<()> = run_with_retry(&policy(5, 10), move || {
            let calls = calls_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HarvestError::Authentication { status: 401 })
            }
        })
        .await;
        assert!(matches!(
            outcome.result,
            Err(HarvestError::Authentication { .. })
        ));
        assert_eq!(outcome.retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_after_is_honored_verbatim() {
        tokio::time::pause();
        let start = tokio::time::Instant::now();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();
        let outcome = run_with_retry(&policy(5, 1), move || {
            let calls = calls_op.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HarvestError::RateLimit {
                        retry_after: Some(Duration::from_secs(2)),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.rate_limit_hits, 2);
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        tokio::time::pause();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();
        let outcome: RetryOutcome<()> = run_with_retry(&policy(2, 1), move || {
            let calls = calls_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HarvestError::ServerError {
                    status: 500,
                    message: "down".into(),
                })
            }
        })
        .await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
