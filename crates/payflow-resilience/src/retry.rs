//! Fixed-delay retry.
//!
//! Only failures the caller classifies as transient are retried; anything
//! else returns immediately. The delay is an async sleep and never blocks a
//! worker thread.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Pause between consecutive attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Runs `operation` until it succeeds, fails permanently, or the
    /// attempts are used up. Returns the last error in the latter cases.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < max_attempts && is_transient(&error) => {
                    tracing::debug!(attempt, max_attempts, %error, "transient failure, retrying");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures_with_fixed_delay() {
        // Arrange
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(200),
        };
        let calls = Cell::new(0);
        let started = tokio::time::Instant::now();

        // Act
        let result: Result<u32, String> = policy
            .run(
                |attempt| {
                    calls.set(calls.get() + 1);
                    async move {
                        if attempt < 3 {
                            Err("timeout".to_owned())
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |_| true,
            )
            .await;

        // Assert
        assert_eq!(result, Ok(3));
        assert_eq!(calls.get(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(10),
        };
        let calls = Cell::new(0);

        let result: Result<(), String> = policy
            .run(
                |_| {
                    calls.set(calls.get() + 1);
                    async { Err("unavailable".to_owned()) }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Err("unavailable".to_owned()));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Cell::new(0);

        let result: Result<(), String> = policy
            .run(
                |_| {
                    calls.set(calls.get() + 1);
                    async { Err("protocol".to_owned()) }
                },
                |error| error != "protocol",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
