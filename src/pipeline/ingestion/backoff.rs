use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::common::error::{Result, ScraperError};
use crate::config::RetryConfig;

/// Retry-with-exponential-backoff used by both network stages.
///
/// Any error triggers another attempt until `max_attempts` is reached; the
/// wait before attempt `n + 1` is `base_delay * 2^n` plus up to `max_jitter`.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_attempts: u32,
    base_delay: Duration,
    max_jitter: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, base_delay: Duration, max_jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_jitter,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay(), config.max_jitter())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Deterministic part of the wait after zero-based failed attempt `attempt`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay_for(attempt) + jitter
    }

    /// Run `op` until it succeeds or attempts run out. `op` receives the
    /// zero-based attempt number.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            debug!(operation, attempt = attempt + 1, max = self.max_attempts, "attempt");
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= self.max_attempts => {
                    warn!(operation, attempts = self.max_attempts, error = %e, "giving up");
                    return Err(ScraperError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: self.max_attempts,
                        last_error: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        transient = e.is_transient(),
                        error = %e,
                        "attempt failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::PageFailure;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_attempts: u32) -> Backoff {
        Backoff::new(max_attempts, Duration::from_millis(1), Duration::ZERO)
    }

    #[test]
    fn test_delay_doubles() {
        let b = Backoff::new(5, Duration::from_millis(100), Duration::ZERO);
        assert_eq!(b.base_delay_for(0), Duration::from_millis(100));
        assert_eq!(b.base_delay_for(1), Duration::from_millis(200));
        assert_eq!(b.base_delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let b = Backoff::new(3, Duration::from_millis(10), Duration::from_millis(5));
        for _ in 0..50 {
            let d = b.delay_for(1);
            assert!(d >= Duration::from_millis(20) && d <= Duration::from_millis(25));
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result = quick(3)
            .retry("flaky", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ScraperError::page(PageFailure::Timeout, "slow"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let calls = AtomicU32::new(0);
        let err = quick(2)
            .retry("always", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err::<(), _>(ScraperError::BrowserSetup(format!("attempt {attempt}")))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match err {
            ScraperError::RetriesExhausted { attempts, last_error, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error.to_string(), "Browser setup failed: attempt 1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let _ = quick(0)
            .retry("once", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ScraperError::EmptyResult) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
