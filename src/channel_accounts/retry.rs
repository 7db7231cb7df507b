use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Caller-supplied retry policy with jittered exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Fraction of the backoff added or removed at random (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
            jitter_factor: 0.0,
        }
    }

    /// Backoff before attempt `attempt + 1` (0-indexed).
    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exp_backoff = (self.base_backoff_ms as f64) * 2_f64.powi(attempt as i32);
        let capped = exp_backoff.min(self.max_backoff_ms as f64);

        let jitter_range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects the error, or the
/// attempts run out. The last error is returned.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    mut should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        attempt += 1;

        if !should_retry(&err) {
            debug!(operation = operation_name, error = %err, "terminal error, not retrying");
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(
                operation = operation_name,
                attempts = attempt,
                error = %err,
                "all retry attempts exhausted"
            );
            return Err(err);
        }

        let backoff = config.calculate_backoff(attempt - 1);
        warn!(
            operation = operation_name,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "attempt failed, backing off before retry"
        );
        sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(config.calculate_backoff(0), Duration::from_secs(1));
        assert_eq!(config.calculate_backoff(2), Duration::from_secs(4));
        assert_eq!(config.calculate_backoff(10), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_if(
            "flaky",
            &RetryConfig::default(),
            || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err("transient".to_string()),
                    n => Ok(n),
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_terminal_error_and_on_exhaustion() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_if(
            "terminal",
            &RetryConfig::default(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("terminal".to_string())
            },
            |e| e != "terminal",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_if(
            "exhausted",
            &RetryConfig::default(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("transient".to_string())
            },
            |_| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_none_is_single_shot() {
        let calls = AtomicU32::new(0);
        let _: Result<(), String> = retry_if(
            "once",
            &RetryConfig::none(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("transient".to_string())
            },
            |_| true,
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
