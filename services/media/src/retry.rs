//! Bounded retry with backoff.
//!
//! `RetryExecutor` runs an async operation until it succeeds, fails with an
//! error the caller does not consider retryable, or the attempt budget is
//! spent. Delays between attempts come from the `backoff` crate.

use backoff::backoff::{Backoff, Constant};
use backoff::ExponentialBackoffBuilder;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed(Duration),
    /// Doubling delay starting at `initial`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

/// Attempt budget plus delay strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of invocations, including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Fixed(delay),
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Exponential { initial, max },
        }
    }

    /// Same strategy, different attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn delays(&self) -> Box<dyn Backoff + Send> {
        match self.backoff {
            BackoffStrategy::Fixed(delay) => Box::new(Constant::new(delay)),
            BackoffStrategy::Exponential { initial, max } => Box::new(
                ExponentialBackoffBuilder::new()
                    .with_initial_interval(initial)
                    .with_max_interval(max)
                    .with_multiplier(2.0)
                    .with_randomization_factor(0.0)
                    .with_max_elapsed_time(None)
                    .build(),
            ),
        }
    }

    fn max_delay(&self) -> Duration {
        match self.backoff {
            BackoffStrategy::Fixed(delay) => delay,
            BackoffStrategy::Exponential { max, .. } => max,
        }
    }
}

/// Why a retried operation finally gave up.
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Error from the last invocation.
    pub error: E,
    /// Number of invocations performed.
    pub attempts: u32,
    /// `true` when the budget ran out on a retryable error, `false` when a
    /// non-retryable error stopped the loop.
    pub exhausted: bool,
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `op` (with the 1-based attempt number) until it succeeds, fails
    /// with an error for which `is_retryable` is false, or `max_attempts`
    /// invocations have been made.
    pub async fn run<T, E, F, Fut, R>(&self, mut op: F, is_retryable: R) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut delays = self.policy.delays();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !is_retryable(&error) {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    exhausted: false,
                });
            }

            if attempt >= max_attempts {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    exhausted: true,
                });
            }

            let delay = delays
                .next_backoff()
                .unwrap_or_else(|| self.policy.max_delay());

            warn!(
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retryable failure, backing off"
            );

            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delays_double_and_cap() {
        let policy = RetryPolicy::exponential(
            10,
            Duration::from_millis(10),
            Duration::from_millis(35),
        );
        let mut delays = policy.delays();
        let millis: Vec<u128> = (0..4)
            .map(|_| delays.next_backoff().unwrap().as_millis())
            .collect();
        assert_eq!(millis, vec![10, 20, 35, 35]);
    }

    #[test]
    fn test_fixed_delays_are_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(7));
        let mut delays = policy.delays();
        assert_eq!(delays.next_backoff(), Some(Duration::from_millis(7)));
        assert_eq!(delays.next_backoff(), Some(Duration::from_millis(7)));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::fixed(3, Duration::from_millis(1)));

        let result: Result<(), _> = executor
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("transient") }
                },
                |_| true,
            )
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(failure.attempts, 3);
        assert!(failure.exhausted);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::fixed(5, Duration::from_millis(1)));

        let failure = executor
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("permanent") }
                },
                |_| false,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!failure.exhausted);
        assert_eq!(failure.error, "permanent");
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(RetryPolicy::exponential(
            4,
            Duration::from_millis(1),
            Duration::from_millis(4),
        ));

        let value = executor
            .run(
                |attempt| async move {
                    if attempt < 3 {
                        Err("not yet")
                    } else {
                        Ok(attempt)
                    }
                },
                |_| true,
            )
            .await
            .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_invokes_once() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::fixed(0, Duration::from_millis(1)));
        let _ = executor
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("x") }
                },
                |_| true,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
