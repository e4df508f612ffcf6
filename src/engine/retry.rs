use std::future::Future;
use std::time::Duration;

use crate::error::{timeout_error, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Growth {
    Linear,
    Exponential,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Hard limit on a single attempt.
    pub timeout: Duration,
    pub growth: Growth,
}

impl RetryPolicy {
    /// Delay before the attempt following the `failures`-th failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let failures = failures.max(1);

        let delay = match self.growth {
            Growth::Linear => self.base_delay.saturating_mul(failures),
            Growth::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(failures - 1)),
        };

        delay.min(self.max_delay)
    }
}

/// Runs `f` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up. Each attempt is bounded by the policy
/// timeout.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(policy.timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error()),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(op, attempt, ?delay, "{}, retrying", err);
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::error!(op, attempt, "{}", err);
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{invalid_input_error, upstream_error};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            timeout: Duration::from_secs(8),
            growth: Growth::Exponential,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let exponential = policy();
        assert_eq!(exponential.backoff(1), Duration::from_secs(1));
        assert_eq!(exponential.backoff(2), Duration::from_secs(2));
        assert_eq!(exponential.backoff(3), Duration::from_secs(3));

        let linear = RetryPolicy {
            growth: Growth::Linear,
            max_delay: Duration::from_secs(60),
            base_delay: Duration::from_secs(5),
            ..policy()
        };
        assert_eq!(linear.backoff(1), Duration::from_secs(5));
        assert_eq!(linear.backoff(4), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();

        let value = with_retry(&policy(), "fetch", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(upstream_error())
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_caller_errors() {
        let calls = &AtomicU32::new(0);

        let err = with_retry(&policy(), "fetch", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(invalid_input_error())
        })
        .await
        .unwrap_err();

        assert!(err.is_invalid_input_error());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempts_time_out() {
        let calls = &AtomicU32::new(0);

        let err = with_retry(&policy(), "fetch", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<Result<(), Error>>().await
        })
        .await
        .unwrap_err();

        assert_eq!(err, timeout_error());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
