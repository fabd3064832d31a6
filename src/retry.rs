//! Retry policy with exponential backoff
//!
//! The same loop drives pipeline stages, batch tasks and workflow tasks: run
//! the operation, and on failure sleep `initial_delay * base^(retry - 1)`
//! (capped at `max_delay`, optionally jittered) before the next attempt. No
//! sleep follows the final attempt.

use crate::cancel::{sleep_or_cancel, CancellationFlag};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration for a unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(default = "default_exponential_base")]
    pub backoff_base: f64,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    #[serde(default)]
    pub jitter: bool,

    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Per-attempt time limit
    #[serde(default, with = "humantime_serde")]
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            initial_delay: default_initial_delay(),
            backoff_base: default_exponential_base(),
            max_delay: default_max_delay(),
            jitter: false,
            jitter_factor: default_jitter_factor(),
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_base: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff_base,
            max_delay,
            ..Self::default()
        }
    }

    /// A single attempt with no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter = true;
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay preceding the given retry (1 = the second attempt)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let multiplier = self.backoff_base.powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = if secs.is_finite() {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_delay
        };
        delay.min(self.max_delay)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let mut rng = rand::rng();
        let jitter_range = delay.as_secs_f64() * self.jitter_factor;
        let jitter = rng.random_range(-jitter_range / 2.0..=jitter_range / 2.0);
        Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
    }
}

/// Outcome of [`run_with_retry`]
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Attempts actually made
    pub attempts: u32,
    /// Backoff slept before each retry, in order
    pub delays: Vec<Duration>,
    /// Retrying stopped because the cancellation flag was set
    pub cancelled: bool,
}

/// Error from a single attempt run under [`RetryPolicy::attempt_timeout`]
#[derive(Debug)]
pub enum AttemptError<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: Display> Display for AttemptError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Failed(e) => write!(f, "{e}"),
            AttemptError::TimedOut(limit) => write!(f, "attempt timed out after {limit:?}"),
        }
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// `operation` receives the 1-based attempt number. When a cancellation flag
/// is given it is checked before each retry and on waking from the backoff
/// sleep; a cancelled run returns the last error.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationFlag>,
    label: &str,
    mut operation: F,
) -> RetryOutcome<T, AttemptError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delays = Vec::new();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation(attempt)).await {
                Ok(result) => result.map_err(AttemptError::Failed),
                Err(_) => Err(AttemptError::TimedOut(limit)),
            },
            None => operation(attempt).await.map_err(AttemptError::Failed),
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    delays,
                    cancelled: false,
                };
            }
            Err(err) => err,
        };

        if attempt >= max_attempts {
            warn!(
                "{} failed after {} attempt(s): {}",
                label, attempt, err
            );
            return RetryOutcome {
                result: Err(err),
                attempts: attempt,
                delays,
                cancelled: false,
            };
        }

        let delay = policy.apply_jitter(policy.delay_for(attempt));
        warn!(
            "{} failed (attempt {}/{}): {}; retrying after {:?}",
            label, attempt, max_attempts, err, delay
        );

        if !sleep_or_cancel(cancel, delay).await {
            debug!("{} retry abandoned: cancelled during backoff", label);
            return RetryOutcome {
                result: Err(err),
                attempts: attempt,
                delays,
                cancelled: true,
            };
        }
        delays.push(delay);
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter_factor() -> f64 {
    0.3
}

fn default_exponential_base() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(
            attempts,
            Duration::from_millis(10),
            2.0,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_exponential_delays() {
        let policy = fast_policy(5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::exponential(
            10,
            Duration::from_secs(1),
            10.0,
            Duration::from_secs(5),
        );
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = fast_policy(3).with_jitter(0.5);
        for _ in 0..50 {
            let d = policy.apply_jitter(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(75));
            assert!(d <= Duration::from_millis(125));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_makes_exact_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome: RetryOutcome<(), _> = run_with_retry(&fast_policy(3), None, "op", |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("nope")
            }
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.delays.len(), 2);
        assert!(outcome.delays[0] < outcome.delays[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let outcome = run_with_retry(&fast_policy(4), None, "op", |attempt| async move {
            if attempt < 3 {
                Err("transient")
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 3);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let policy = RetryPolicy::no_retry().with_timeout(Duration::from_millis(50));
        let outcome = run_with_retry(&policy, None, "slow", |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, String>(())
        })
        .await;

        assert!(matches!(outcome.result, Err(AttemptError::TimedOut(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retrying() {
        let flag = CancellationFlag::new();
        flag.cancel();
        let outcome = run_with_retry(&fast_policy(5), Some(&flag), "op", |_| async {
            Err::<(), _>("fail")
        })
        .await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.attempts, 1);
    }
}
