//! Exponential backoff with full jitter for retryable wire errors.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// A reusable retry policy wrapping a fallible async operation.
///
/// Only errors for which [`Error::is_retryable`] returns true are retried. After
/// [`RetryConfig::max_attempts`] the last error is returned as-is.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    cfg: RetryConfig,
}

impl RetryPolicy {
    pub fn new(cfg: RetryConfig) -> Self {
        Self { cfg }
    }

    /// The backoff ceiling for attempt `k` (0-based), before jitter is applied.
    fn backoff_for(&self, k: u32) -> Duration {
        let scaled = self.cfg.initial_backoff.as_secs_f64() * self.cfg.multiplier.powi(k as i32);
        let capped = scaled.min(self.cfg.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Runs `op`, retrying on retryable errors with full-jitter exponential backoff.
    #[instrument(skip(self, op), fields(max_attempts = self.cfg.max_attempts))]
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < self.cfg.max_attempts && err.is_retryable() => {
                    let ceiling = self.backoff_for(attempt);
                    let sleep_for = jittered(ceiling);
                    debug!(attempt, ?sleep_for, error = %err, "retrying after transient error");
                    tokio::time::sleep(sleep_for).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Draws a full-jitter sleep duration `U(0, ceiling)`.
fn jittered(ceiling: Duration) -> Duration {
    if ceiling.is_zero() {
        return ceiling;
    }
    let millis = ceiling.as_millis().max(1) as u64;
    let drawn = rand::thread_rng().gen_range(0..=millis);
    Duration::from_millis(drawn)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
        });

        let calls = AtomicU32::new(0);
        let result = policy
            .run(|attempt| {
                let calls = &calls;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(Error::ServerError {
                            status: 500,
                            body: "boom".into(),
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        });

        let calls = AtomicU32::new(0);
        let err = policy
            .run(|_| {
                let calls = &calls;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::ServerError {
                        status: 503,
                        body: "down".into(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ServerError { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let policy = RetryPolicy::new(RetryConfig::default());
        let calls = AtomicU32::new(0);

        let err = policy
            .run(|_| {
                let calls = &calls;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::ClientError {
                        status: 404,
                        body: "nope".into(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ClientError { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
