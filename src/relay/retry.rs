//! Fixed-delay retry on rate-limit signals.
//!
//! This is the only retry policy in the relay: rate-limited attempts are retried after a
//! constant pause, every other failure is returned to the caller straight away. There is
//! no jitter and no growth, so the worst case per call is `(max_attempts - 1) * delay`.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{RelayConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_MS};

/// Errors that can tell whether they came from a rate limiter.
pub trait RateLimitSignal {
    fn is_rate_limited(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Attempting { attempt: u32 },
    Waiting { attempt: u32 },
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl From<&RelayConfig> for RetryPolicy {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt was rate limited
    #[error("rate limited on all {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// A non-retryable failure stopped the loop
    #[error("attempt {attempts} failed: {error}")]
    Aborted { attempts: u32, error: E },

    /// The caller went away while waiting to retry
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Aborted { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

/// Drives one operation through the retry state machine.
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `operation` until it succeeds, fails for a reason other than rate limiting,
    /// or runs out of attempts.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        E: RateLimitSignal + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_while(|| true, operation).await
    }

    /// Like [`execute`](Self::execute), but `keep_going` is checked after each wait and a
    /// `false` stops the loop before another attempt is sent.
    pub async fn execute_while<T, E, F, Fut, K>(
        &self,
        keep_going: K,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: RateLimitSignal + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        K: Fn() -> bool,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut state = RetryState::Idle;
        let mut attempt = 1;

        loop {
            transition(&mut state, RetryState::Attempting { attempt });

            let err = match operation(attempt).await {
                Ok(value) => {
                    transition(&mut state, RetryState::Succeeded);
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_rate_limited() {
                transition(&mut state, RetryState::Failed);
                return Err(RetryError::Aborted {
                    attempts: attempt,
                    error: err,
                });
            }

            if attempt >= max_attempts {
                transition(&mut state, RetryState::Failed);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            warn!(
                attempt,
                max_attempts,
                delay_ms = self.policy.delay.as_millis() as u64,
                "Rate limit hit, retrying after delay"
            );
            transition(&mut state, RetryState::Waiting { attempt });
            tokio::time::sleep(self.policy.delay).await;

            if !keep_going() {
                transition(&mut state, RetryState::Failed);
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;
        }
    }
}

fn transition(state: &mut RetryState, next: RetryState) {
    debug!(from = ?*state, to = ?next, "retry state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fmt;
    use tokio::time::Instant;

    #[derive(Debug, PartialEq)]
    enum FakeError {
        RateLimited,
        BadRequest,
    }

    impl fmt::Display for FakeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl RateLimitSignal for FakeError {
        fn is_rate_limited(&self) -> bool {
            matches!(self, FakeError::RateLimited)
        }
    }

    fn controller() -> RetryController {
        RetryController::new(RetryPolicy::default())
    }

    /// k rate limits followed by success: k + 1 calls and exactly k delays.
    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_k_rate_limits() {
        for k in 0..=5u32 {
            let calls = Cell::new(0u32);
            let started = Instant::now();

            let result = controller()
                .execute(|_| {
                    calls.set(calls.get() + 1);
                    let n = calls.get();
                    async move {
                        if n <= k {
                            Err(FakeError::RateLimited)
                        } else {
                            Ok("reply")
                        }
                    }
                })
                .await;

            assert_eq!(result.unwrap(), "reply");
            assert_eq!(calls.get(), k + 1);
            assert_eq!(started.elapsed(), Duration::from_secs(6) * k);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_six_attempts() {
        let calls = Cell::new(0u32);
        let started = Instant::now();

        let result: Result<(), _> = controller()
            .execute(|_| {
                calls.set(calls.get() + 1);
                async { Err(FakeError::RateLimited) }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 6);
                assert_eq!(last, FakeError::RateLimited);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(calls.get(), 6);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let calls = Cell::new(0u32);
        let started = Instant::now();

        let result: Result<(), _> = controller()
            .execute(|_| {
                calls.set(calls.get() + 1);
                async { Err(FakeError::BadRequest) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Aborted { attempts: 1, .. }));
        assert_eq!(err.attempts(), 1);
        assert_eq!(calls.get(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    /// Closing the connection during a wait stops further attempts.
    #[tokio::test(start_paused = true)]
    async fn test_cancelled_while_waiting() {
        let calls = Cell::new(0u32);
        let open = Cell::new(true);

        let result: Result<(), _> = controller()
            .execute_while(
                || open.get(),
                |_| {
                    calls.set(calls.get() + 1);
                    open.set(false);
                    async { Err(FakeError::RateLimited) }
                },
            )
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = crate::config::AppConfig::default().relay;
        config.max_attempts = 0;
        config.retry_delay_ms = 250;
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay, Duration::from_millis(250));
    }
}
