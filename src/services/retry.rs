//! Retry and polling policies.
//!
//! Transient provider errors are retried through [`retry_with_policy`];
//! long waits (restore polling) go through [`poll_until`]. Call sites never
//! write their own sleep loops.

use crate::{
    errors::{MigrationError, MigrationResult},
    services::remote::RemoteResult,
};
use rand::Rng;
use std::{future::Future, time::Duration};
use tracing::{debug, warn};

/// Bounded exponential backoff with optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction (0.0..=1.0) of each delay randomized away to spread retries.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; used by the self-test and unit tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter <= 0.0 || raw.is_zero() {
            return raw;
        }
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 - rand::thread_rng().gen_range(0.0..=jitter);
        raw.mul_f64(factor)
    }
}

/// Run `call` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are exhausted.
///
/// `operation` and `resource` name what failed in the surfaced error.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    resource: &str,
    mut call: F,
) -> MigrationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    resource,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient remote error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(MigrationError::Remote {
                    operation: operation.to_string(),
                    resource: resource.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }
        }
    }
}

/// Fixed-interval polling schedule for long waits.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSchedule {
    pub interval: Duration,
    /// `None` polls until done; tests bound it.
    pub max_polls: Option<u32>,
}

impl PollSchedule {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_polls: None,
        }
    }
}

/// Call `check` until it reports `true`, sleeping `schedule.interval` between
/// checks. Returns `false` if `max_polls` ran out first.
///
/// Each sleep is a safe interruption point: nothing is held across it.
pub async fn poll_until<F, Fut>(schedule: &PollSchedule, mut check: F) -> MigrationResult<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MigrationResult<bool>>,
{
    let mut polls = 0u32;
    loop {
        polls += 1;
        if check().await? {
            debug!(polls, "poll condition satisfied");
            return Ok(true);
        }
        if schedule.max_polls.is_some_and(|max| polls >= max) {
            return Ok(false);
        }
        tokio::time::sleep(schedule.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::remote::RemoteError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(9), Duration::from_millis(350));
    }

    #[test]
    fn jitter_only_shortens_delays() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for attempt in 1..6 {
            let delay = policy.delay_for(attempt);
            let ceiling = RetryPolicy {
                jitter: 0.0,
                ..policy.clone()
            }
            .delay_for(attempt);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let value = retry_with_policy(&RetryPolicy::immediate(5), "list", "photos", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RemoteError::transient("throttled"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_names_operation_and_resource() {
        let err = retry_with_policy(&RetryPolicy::immediate(3), "list objects", "photos", || async {
            Err::<(), _>(RemoteError::transient("throttled"))
        })
        .await
        .unwrap_err();
        match err {
            MigrationError::Remote {
                operation,
                resource,
                attempts,
                ..
            } => {
                assert_eq!(operation, "list objects");
                assert_eq!(resource, "photos");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result = retry_with_policy(&RetryPolicy::immediate(5), "get", "b/k", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(RemoteError::not_found("gone")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_until_stops_when_condition_holds() {
        let calls = AtomicU32::new(0);
        let schedule = PollSchedule::every(Duration::ZERO);
        let done = poll_until(&schedule, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n >= 2) }
        })
        .await
        .unwrap();
        assert!(done);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_respects_max_polls() {
        let schedule = PollSchedule {
            interval: Duration::ZERO,
            max_polls: Some(2),
        };
        let done = poll_until(&schedule, || async { Ok(false) }).await.unwrap();
        assert!(!done);
    }
}
