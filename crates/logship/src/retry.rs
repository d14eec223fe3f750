// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff shared by every network-facing operation.
//!
//! The collector wraps a whole polling cycle and the shipper wraps a single delivery in
//! [`retry`]. An operation is attempted at most [`RetryPolicy::max_attempts`] times; the
//! last error is handed back as [`RetryError::Exhausted`] and callers treat it as fatal.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Retries allowed after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Growth applied to the delay after every failed attempt.
    pub multiplier: f64,
    /// Upper bound for a single delay, before jitter.
    pub max_interval: Duration,
    pub max_retries: u32,
    /// Jitter as a fraction of the delay, 0.0 disables it.
    pub randomization_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 2.0,
            max_interval: Duration::from_secs(60),
            max_retries: DEFAULT_MAX_RETRIES,
            randomization_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter, mostly useful for deterministic tests.
    #[must_use]
    pub fn exponential(initial_interval: Duration, max_retries: u32) -> Self {
        Self {
            initial_interval,
            max_retries,
            randomization_factor: 0.0,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based), jitter excluded.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        // Past 2^63 the cap has long been reached.
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.randomization_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let secs = delay.as_secs_f64();
        let delta = secs * self.randomization_factor.min(1.0);
        let randomized = rand::thread_rng().gen_range((secs - delta)..=(secs + delta));
        Duration::from_secs_f64(randomized)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the error of the final one.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The cancellation token fired before the operation succeeded.
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

/// Runs `operation` until it succeeds, the policy is exhausted, or `cancel` fires.
///
/// `label` prefixes every log line (e.g. `SHIPPER`). Each attempt is all-or-nothing:
/// nothing from a failed attempt is carried into the next one.
pub async fn retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts });
        }
        // an attempt counts as soon as it starts, even if cancellation interrupts it
        attempts += 1;
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
            result = operation() => result,
        };

        let err = match result {
            Ok(value) => {
                if attempts > 1 {
                    debug!("{label} | Succeeded after {attempts} attempts");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if attempts >= max_attempts {
            error!("{label} | Attempt {attempts}/{max_attempts} failed, giving up: {err}");
            return Err(RetryError::Exhausted {
                attempts,
                last: err,
            });
        }

        let delay = policy.jittered(policy.delay(attempts));
        warn!(
            "{label} | Attempt {attempts}/{max_attempts} failed: {err}, retrying in {} ms",
            delay.as_millis()
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::exponential(Duration::from_millis(500), DEFAULT_MAX_RETRIES)
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = RetryPolicy {
            max_interval: Duration::from_secs(3),
            ..fast_policy()
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(4), Duration::from_secs(3));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.jittered(Duration::from_secs(2));
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_default_allows_eleven_attempts() {
        assert_eq!(RetryPolicy::default().max_attempts(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_fourth_attempt_with_growing_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let result = retry(&fast_policy(), &cancel, "TEST", || {
            let calls = Arc::clone(&calls);
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call < 4 {
                    Err(format!("failure {call}"))
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 500ms + 1s + 2s of backoff
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3600), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_eleven_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry(&fast_policy(), &cancel, "TEST", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("always") }
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 11);
                assert_eq!(last, "always");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_when_cancelled_during_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        // attempts fail at 0ms and 500ms, the second backoff runs until 1500ms
        let policy = fast_policy();
        let (result, ()) = tokio::join!(
            retry(&policy, &cancel, "TEST", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("down") }
            }),
            async move {
                tokio::time::sleep(Duration::from_millis(1200)).await;
                trigger.cancel();
            }
        );

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 2 })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_counts_attempt_interrupted_by_cancel() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        // the second attempt hangs until cancellation
        let policy = fast_policy();
        let (result, ()) = tokio::join!(
            retry(&policy, &cancel, "TEST", || {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if call == 2 {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    Err::<(), _>("down")
                }
            }),
            async move {
                tokio::time::sleep(Duration::from_millis(700)).await;
                trigger.cancel();
            }
        );

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 2 })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_stops_when_operation_cancels_while_starting() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result: Result<(), _> = retry(&fast_policy(), &cancel, "TEST", || {
            calls.fetch_add(1, Ordering::SeqCst);
            trigger.cancel();
            async { Err("down") }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_does_not_start_when_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), RetryError<&str>> =
            retry(&fast_policy(), &cancel, "TEST", || async { Ok(()) }).await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 0 })));
    }
}
