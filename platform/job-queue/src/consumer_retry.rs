//! Consumer retry with exponential backoff
//!
//! Wraps a consumer's job-processing step so transient failures are retried
//! locally before the job is handed to a dead-letter store.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy for a consumer.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (first try included)
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles each retry
    pub initial_backoff: Duration,
    /// Cap on the doubled backoff
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Backoff to sleep after a failed attempt (1-based).
    fn backoff_after(&self, attempt: u32) -> Duration {
        let doubled = self
            .initial_backoff
            .saturating_mul(1u32 << (attempt - 1).min(16));
        doubled.min(self.max_backoff)
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is exhausted.
///
/// `context` names the caller in logs (e.g. `"integrations_write_worker"`).
/// Returns the last error when every attempt fails; the caller decides what
/// exhaustion means (usually a DLQ insert).
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
{
    let max_attempts = config.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context, attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt == max_attempts => {
                warn!(context, attempts = attempt, error = %e, "operation failed after max retries");
                return Err(e);
            }
            Err(e) => {
                let backoff = config.backoff_after(attempt);
                warn!(
                    context,
                    attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "operation failed, retrying with backoff"
                );
                sleep(backoff).await;
            }
        }
    }

    unreachable!("max_attempts is at least 1");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_attempt_success_skips_backoff() {
        let config = RetryConfig::default();
        let result =
            retry_with_backoff(|| async { Ok::<_, String>(7) }, &config, "test").await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(5),
            ..RetryConfig::default()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = retry_with_backoff(
            || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("attempt {n}"))
                    } else {
                        Ok(n)
                    }
                }
            },
            &config,
            "test",
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error_when_exhausted() {
        let config = RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
        };

        let result =
            retry_with_backoff(|| async { Err::<i32, _>("persistent") }, &config, "test").await;
        assert_eq!(result, Err("persistent"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };

        assert_eq!(config.backoff_after(1), Duration::from_millis(100));
        assert_eq!(config.backoff_after(2), Duration::from_millis(200));
        assert_eq!(config.backoff_after(3), Duration::from_millis(350));
        assert_eq!(config.backoff_after(9), Duration::from_millis(350));
    }
}
