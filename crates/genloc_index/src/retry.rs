use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Exponential backoff for calls to hosted model APIs.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 5_000, 60_000, 2.0)
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
    ) -> Self {
        let backoff_multiplier = if backoff_multiplier.is_nan() || backoff_multiplier < 1.0 {
            1.0
        } else {
            backoff_multiplier
        };
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms.max(initial_delay_ms)),
            backoff_multiplier,
        }
    }

    /// Policy with no waiting between attempts, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, 0, 0, 1.0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Saturates at `max_delay` when the product leaves `Duration`'s range.
    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier)
            .map_or(self.max_delay, |next| next.min(self.max_delay))
    }

    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Debug,
    {
        let mut attempt: u32 = 0;
        let mut delay = self.initial_delay;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_retryable() {
                        return Err(error);
                    }

                    attempt += 1;
                    if attempt >= self.max_attempts {
                        debug!(attempt, error = ?error, "Retry attempts exhausted");
                        return Err(error);
                    }

                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = ?error, "Retrying after failure");
                    let sleep_duration = delay.min(self.max_delay);
                    if sleep_duration > Duration::ZERO {
                        tokio::time::sleep(sleep_duration).await;
                    }
                    delay = self.next_delay(delay);
                }
            }
        }
    }

    /// Blocking variant for callers already running on a blocking thread.
    pub fn execute_blocking<F, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        E: Retryable + Debug,
    {
        let mut attempt: u32 = 0;
        let mut delay = self.initial_delay;

        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_retryable() {
                        return Err(error);
                    }

                    attempt += 1;
                    if attempt >= self.max_attempts {
                        debug!(attempt, error = ?error, "Retry attempts exhausted");
                        return Err(error);
                    }

                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = ?error, "Retrying after failure");
                    let sleep_duration = delay.min(self.max_delay);
                    if sleep_duration > Duration::ZERO {
                        std::thread::sleep(sleep_duration);
                    }
                    delay = self.next_delay(delay);
                }
            }
        }
    }
}

/// Transient HTTP statuses: rate limiting and server-side failures.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Flaky(bool);

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn blocking_retry_stops_after_success() {
        let policy = RetryPolicy::immediate(5);
        let mut calls = 0;
        let result: Result<u32, Flaky> = policy.execute_blocking(|attempt| {
            calls += 1;
            if attempt < 2 {
                Err(Flaky(true))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::immediate(5);
        let mut calls = 0;
        let result: Result<(), Flaky> = policy.execute_blocking(|_| {
            calls += 1;
            Err(Flaky(false))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn async_retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy::immediate(3);
        let mut calls = 0;
        let result: Result<(), Flaky> = policy
            .execute(|_| {
                calls += 1;
                async { Err(Flaky(true)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn delays_grow_until_the_cap() {
        let policy = RetryPolicy::new(5, 1_000, 3_000, 2.0);
        assert_eq!(policy.next_delay(Duration::from_millis(1_000)), Duration::from_millis(2_000));
        assert_eq!(policy.next_delay(Duration::from_millis(2_000)), Duration::from_millis(3_000));
    }

    #[test]
    fn huge_multipliers_saturate_at_the_cap() {
        let policy = RetryPolicy::new(5, 1_000, 60_000, f64::MAX);
        assert_eq!(policy.next_delay(Duration::from_secs(1)), Duration::from_millis(60_000));
        assert_eq!(policy.next_delay(Duration::MAX), Duration::from_millis(60_000));

        let infinite = RetryPolicy::new(5, 1_000, 60_000, f64::INFINITY);
        assert_eq!(infinite.next_delay(Duration::from_secs(1)), Duration::from_millis(60_000));
        assert_eq!(RetryPolicy::new(5, 1_000, 60_000, f64::NAN), RetryPolicy::new(5, 1_000, 60_000, 1.0));
    }

    #[test]
    fn status_classification() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
    }
}
