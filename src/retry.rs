//! Bounded retry with a fixed delay between attempts
//!
//! Only idempotent operations belong here: re-sending a webhook or re-probing a site is
//! fine, re-appending a configuration block is not.

use log::{debug, warn};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Remediation hint attached to an exhausted retry
pub const RETRY_HINT: &str =
    "check network connectivity and any HTTP proxy settings, then retry manually";

/// Retry policy: how many attempts and how long to wait between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

/// Returned when every attempt failed
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Number of attempts actually made
    pub attempts: u32,
    /// Error returned by the final attempt
    pub last_error: E,
    pub hint: &'static str,
}

impl<E: fmt::Display> fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed after {} attempt(s): {} ({})",
            self.attempts, self.last_error, self.hint
        )
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryFailure<E> {}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

impl RetryPolicy {
    /// Create a policy; zero attempts is treated as a single attempt
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Run `operation` until it succeeds or the attempts are exhausted
    ///
    /// Sleeps `interval` between attempts but never after the final one.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Operation succeeded on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= self.max_attempts => {
                    warn!(
                        "Attempt {}/{} failed, giving up: {}",
                        attempt, self.max_attempts, e
                    );
                    return Err(RetryFailure {
                        attempts: attempt,
                        last_error: e,
                        hint: RETRY_HINT,
                    });
                }
                Err(e) => {
                    warn!(
                        "Attempt {}/{} failed, retrying in {:?}: {}",
                        attempt, self.max_attempts, self.interval, e
                    );
                    tokio::time::sleep(self.interval).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_operation_is_attempted_max_times() {
        let policy = RetryPolicy::new(4, Duration::from_secs(2));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = policy
            .execute(|_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("connection refused")
                }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failure.attempts, 4);
        assert_eq!(failure.last_error, "connection refused");
        assert_eq!(failure.hint, RETRY_HINT);
        // three gaps between four attempts
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_attempt_k_stops_retrying() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result = policy
            .execute(|attempt| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt == 3 {
                        Ok(attempt)
                    } else {
                        Err(format!("attempt {} failed", attempt))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_means_one() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        assert_eq!(policy.max_attempts, 1);
        let result: Result<u8, RetryFailure<&str>> = policy.execute(|_| async { Err("nope") }).await;
        assert_eq!(result.unwrap_err().attempts, 1);
    }

    #[tokio::test]
    async fn test_failure_display_includes_hint() {
        let failure = RetryFailure {
            attempts: 3,
            last_error: "timeout",
            hint: RETRY_HINT,
        };
        let text = failure.to_string();
        assert!(text.contains("3 attempt"));
        assert!(text.contains("timeout"));
        assert!(text.contains("proxy"));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    // An operation that first succeeds on attempt `succeed_on` runs exactly
    // min(succeed_on, max_attempts) times.
    #[quickcheck]
    fn prop_attempt_count_is_bounded(max_attempts: u8, succeed_on: u8) -> bool {
        let max_attempts = (max_attempts % 8) as u32 + 1;
        let succeed_on = (succeed_on % 10) as u32 + 1;

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(_) => return true,
        };

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let policy = RetryPolicy::new(max_attempts, Duration::from_millis(0));
        let result = runtime.block_on(policy.execute(move |attempt| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt >= succeed_on {
                    Ok(())
                } else {
                    Err("not yet")
                }
            }
        }));

        let expected_calls = succeed_on.min(max_attempts);
        calls.load(Ordering::SeqCst) == expected_calls && result.is_ok() == (succeed_on <= max_attempts)
    }
}
