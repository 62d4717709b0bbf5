//! Exponential backoff retry for transient pipeline failures
//!
//! Wraps subprocess invocations (ffmpeg, fpcalc) and database operations so
//! that retryable `JobFailureKind`s (spec §4.1/§7) get re-attempted with
//! backoff before the job is marked failed.

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tracing::warn;

/// Backoff tuning for one retryable operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self { max_retries, ..Self::default() }
    }

    fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            max_elapsed_time: Some(self.max_interval * self.max_retries.max(1)),
            ..Default::default()
        }
    }
}

/// Run `operation` until it succeeds or `config.max_retries` is reached.
pub async fn retry_async<T, E, Fut, F>(
    operation: F,
    config: &RetryConfig,
    operation_name: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    let mut backoff = config.to_backoff();

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= config.max_retries {
                    warn!(
                        operation = %operation_name,
                        attempts,
                        error = %e,
                        "operation failed after max retries"
                    );
                    return Err(e);
                }

                if let Some(duration) = backoff.next_backoff() {
                    let retry_ms = duration.as_millis();
                    warn!(
                        operation = %operation_name,
                        attempt = attempts,
                        error = %e,
                        retry_in_ms = retry_ms,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(duration).await;
                } else {
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig { initial_interval: Duration::from_millis(1), ..RetryConfig::default() };

        let result: Result<&str, &str> = retry_async(
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("transient") } else { Ok("done") }
            },
            &config,
            "test-op",
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let config = RetryConfig { max_retries: 2, initial_interval: Duration::from_millis(1), ..RetryConfig::default() };

        let result: Result<(), &str> = retry_async(|| async { Err("always fails") }, &config, "test-op").await;

        assert_eq!(result, Err("always fails"));
    }
}
