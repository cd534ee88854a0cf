//! Retry policy for store operations.
//!
//! Every store call that can fail transiently runs through a [`RetryPolicy`]:
//!
//! - **Connection-class** failures (dropped/refused connection, I/O error,
//!   timeout) are retried by every policy.
//! - **Conflict-class** failures (a watched key changed before commit) are
//!   retried only by policies built for watch-guarded operations.
//!
//! Delays are randomized exponential: attempt `n` sleeps a uniformly random
//! duration in `[min_delay, min(max_delay, base_delay * 2^(n-1))]`. When the
//! attempt budget runs out the last error is returned unchanged.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use taskq_core::{QueueError, QueueResult};

/// Which failures a policy retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    /// Connection-class failures only.
    Connection,
    /// Connection-class and watch-conflict failures.
    ConnectionOrConflict,
}

impl RetryOn {
    pub fn matches(&self, err: &QueueError) -> bool {
        match self {
            RetryOn::Connection => err.is_connection(),
            RetryOn::ConnectionOrConflict => err.is_connection() || err.is_conflict(),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (`None` = unbounded).
    pub max_attempts: Option<u32>,
    /// Lower bound of every delay.
    pub min_delay: Duration,
    /// Upper bound of the first delay; doubles per attempt.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connection()
    }
}

impl RetryPolicy {
    /// Policy for plain (unwatched) operations.
    pub fn connection() -> Self {
        Self {
            max_attempts: Some(8),
            min_delay: Duration::ZERO,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            retry_on: RetryOn::Connection,
        }
    }

    /// Policy for watch-guarded operations; losing a race is expected there,
    /// so the budget is larger and the delays shorter.
    pub fn conflict() -> Self {
        Self {
            max_attempts: Some(64),
            min_delay: Duration::ZERO,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            retry_on: RetryOn::ConnectionOrConflict,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            ..Self::connection()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, min: Duration, base: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn with_retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    /// Upper bound of the delay after failed attempt `attempt` (1-indexed).
    pub fn delay_ceiling(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 1).min(20);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
            .max(self.min_delay)
    }

    /// Randomized delay after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.delay_ceiling(attempt);
        if ceiling <= self.min_delay {
            return ceiling;
        }
        rng.gen_range(self.min_delay..=ceiling)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> QueueResult<T>
    where
        F: FnMut() -> QueueResult<T>,
    {
        let mut rng = rand::thread_rng();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if self.retry_on.matches(&err) && self.should_retry(attempt) => {
                    let delay = self.delay_for_attempt(attempt, &mut rng);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying store operation"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskq_core::StoreError;

    fn fast(policy: RetryPolicy) -> RetryPolicy {
        policy.with_delays(Duration::ZERO, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn ceiling_grows_exponentially_and_caps() {
        let policy = RetryPolicy::connection().with_delays(
            Duration::ZERO,
            Duration::from_millis(100),
            Duration::from_secs(1),
        );

        assert_eq!(policy.delay_ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.delay_ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.delay_ceiling(3), Duration::from_millis(400));
        assert_eq!(policy.delay_ceiling(5), Duration::from_secs(1));
        assert_eq!(policy.delay_ceiling(60), Duration::from_secs(1));
    }

    #[test]
    fn randomized_delay_stays_within_bounds() {
        let policy = RetryPolicy::connection().with_delays(
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_secs(2),
        );
        let mut rng = rand::thread_rng();

        for attempt in 1..10 {
            let delay = policy.delay_for_attempt(attempt, &mut rng);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= policy.delay_ceiling(attempt));
        }
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::connection().with_max_attempts(Some(3));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let unbounded = RetryPolicy::conflict().with_max_attempts(None);
        assert!(unbounded.should_retry(u32::MAX - 1));
    }

    #[test]
    fn retries_connection_errors_until_success() {
        let policy = fast(RetryPolicy::connection());
        let mut calls = 0;

        let result = policy.run("test", || {
            calls += 1;
            if calls < 3 {
                Err(StoreError::connection("reset").into())
            } else {
                Ok(calls)
            }
        });

        assert_eq!(result, Ok(3));
    }

    #[test]
    fn connection_policy_does_not_retry_conflicts() {
        let policy = fast(RetryPolicy::connection());
        let mut calls = 0;

        let result: QueueResult<()> = policy.run("test", || {
            calls += 1;
            Err(StoreError::Conflict.into())
        });

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls, 1);
    }

    #[test]
    fn conflict_policy_retries_conflicts() {
        let policy = fast(RetryPolicy::conflict());
        let mut calls = 0;

        let result = policy.run("test", || {
            calls += 1;
            if calls < 5 {
                Err(StoreError::Conflict.into())
            } else {
                Ok(())
            }
        });

        assert!(result.is_ok());
        assert_eq!(calls, 5);
    }

    #[test]
    fn exhaustion_returns_last_error() {
        let policy = fast(RetryPolicy::connection()).with_max_attempts(Some(4));
        let mut calls = 0;

        let result: QueueResult<()> = policy.run("test", || {
            calls += 1;
            Err(StoreError::connection(format!("attempt {calls}")).into())
        });

        assert_eq!(
            result,
            Err(QueueError::Store(StoreError::connection("attempt 4")))
        );
        assert_eq!(calls, 4);
    }

    #[test]
    fn non_retryable_errors_fail_fast() {
        let policy = fast(RetryPolicy::conflict());
        let mut calls = 0;

        let result: QueueResult<()> = policy.run("test", || {
            calls += 1;
            Err(StoreError::command("WRONGTYPE").into())
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
