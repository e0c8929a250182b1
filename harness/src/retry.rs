//! Bounded retry for network harness calls
//!
//! A fixed number of attempts with a fixed delay between them. Only transient
//! failures are retried; typed protocol failures return on the first attempt.

use std::time::Duration;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};

/// Default number of attempts per call
pub const DEFAULT_ATTEMPTS: u32 = 5;

/// Default delay between attempts in milliseconds
pub const DEFAULT_DELAY_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are spent. The last error is returned unchanged.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> HarnessResult<T>
    where
        F: FnMut() -> HarnessResult<T>,
    {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if e.is_retryable() && attempt < self.attempts {
                        debug!(call = what, attempt, error = %e, "Retrying after transient failure");
                        std::thread::sleep(self.delay);
                        last_error = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| HarnessError::http(format!("{what}: no attempts made"), false)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let calls = Cell::new(0);
        let result = fast(5).run("dataset_request", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(HarnessError::http("connection reset", true))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_attempts() {
        let calls = Cell::new(0);
        let err = fast(5)
            .run("post_results", || -> HarnessResult<()> {
                calls.set(calls.get() + 1);
                Err(HarnessError::http("timed out", true))
            })
            .unwrap_err();
        assert_eq!(calls.get(), 5);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_typed_failures_not_retried() {
        let calls = Cell::new(0);
        let err = fast(5)
            .run("post_results", || -> HarnessResult<()> {
                calls.set(calls.get() + 1);
                Err(HarnessError::protocol("DetectionRepost", "already posted"))
            })
            .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert_eq!(err.reason(), Some("DetectionRepost"));
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 5);
        assert_eq!(fast(0).attempts(), 1);
    }
}
