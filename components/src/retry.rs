use crate::host::HostError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded retry with exponential backoff and jitter. Only errors the host
/// reports as retryable are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base: Duration::from_secs(1),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

/// The error that ended a [`RetryPolicy::run`].
#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub exhausted: bool,
    pub error: HostError,
}

impl RetryPolicy {
    /// Delay before the attempt after failed attempt `attempt` (1-based),
    /// without jitter: `base * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(attempt))
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HostError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        exhausted: false,
                        error,
                    })
                }
                Err(error) if attempt >= self.max_attempts => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        exhausted: true,
                        error,
                    })
                }
                Err(error) => {
                    let delay = self.backoff(attempt) + self.jitter();
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after host error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn conflict() -> HostError {
        HostError::Api {
            status: 409,
            message: "a prune operation is already running".to_string(),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(9), Duration::from_secs(512));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), _> = RetryPolicy::default()
            .run("prune", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(failure.attempts, 10);
        assert!(failure.exhausted);
        // sum of 2^n for n in 1..=9, jitter adds at most 9s
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1022));
        assert!(elapsed <= Duration::from_secs(1031));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = RetryPolicy::default()
            .run("prune", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HostError::Transport {
                    message: "connection refused".to_string(),
                })
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!failure.exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let result = RetryPolicy::default()
            .run("prune", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok("pruned")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "pruned");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
