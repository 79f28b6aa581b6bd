//! Retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::transport::TransportError;

/// Backoff policy applied to every transport call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Upper bound on a single attempt; exceeding it counts as transient.
    pub attempt_timeout: Duration,
    /// Adds ±25% jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if !self.jitter || capped <= 0.0 {
            return Duration::from_secs_f64(capped.max(0.0));
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        Duration::from_secs_f64((capped + capped * 0.25 * offset).max(0.0))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "retry policy needs at least one attempt".into(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(EngineError::InvalidConfig(format!(
                "backoff factor must be >= 1, got {}",
                self.backoff_factor
            )));
        }
        if self.attempt_timeout.is_zero() {
            return Err(EngineError::InvalidConfig(
                "attempt timeout must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Runs `op` until it succeeds, fails fatally, or exhausts the policy.
///
/// Only the backoff sleep observes `cancel`; an attempt already started runs
/// to completion or timeout.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.attempt_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Transient(format!(
                "timed out after {:?}",
                policy.attempt_timeout
            ))),
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = what, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !err.is_transient() {
            warn!(op = what, attempt, error = %err, "fatal transport error");
            return Err(err.into());
        }
        if attempt >= policy.max_attempts {
            warn!(op = what, attempt, error = %err, "retries exhausted");
            return Err(err.into());
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(op = what, attempt, error = %err, ?delay, "transient failure, backing off");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Aborted),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.initial_delay, Duration::from_secs(1));
        assert!((p.backoff_factor - 2.0).abs() < f64::EPSILON);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn delay_backoff_and_cap() {
        let p = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..policy()
        };
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(p.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(p.delay_for_attempt(100), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let p = RetryPolicy::default();
        for _ in 0..50 {
            let d = p.delay_for_attempt(2).as_secs_f64();
            assert!((1.5..=2.5).contains(&d), "delay {d}");
        }
    }

    #[test]
    fn validate_rejects_nonsense() {
        let zero = RetryPolicy {
            max_attempts: 0,
            ..policy()
        };
        assert!(zero.validate().is_err());
        let shrinking = RetryPolicy {
            backoff_factor: 0.5,
            ..policy()
        };
        assert!(shrinking.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let value = with_retry(&policy(), &cancel, "send", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(TransportError::Transient("rate limited".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1 s + 2 s of backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_returns_last_error() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&policy(), &CancellationToken::new(), "send", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TransportError::Transient("503".into())) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            err,
            EngineError::Transport(TransportError::Transient(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&policy(), &CancellationToken::new(), "send", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TransportError::Fatal("forbidden".into())) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, EngineError::Transport(TransportError::Fatal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_transient() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy {
            attempt_timeout: Duration::from_secs(5),
            ..policy()
        };
        let value = with_retry(&p, &CancellationToken::new(), "fetch", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok::<_, TransportError>("ok")
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let p = RetryPolicy {
            initial_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            ..policy()
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = with_retry(&p, &cancel, "send", || async {
            Err::<(), _>(TransportError::Transient("busy".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Aborted));
    }
}
