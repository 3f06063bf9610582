//! Bounded retries with exponential backoff.
//!
//! Each attempt reports an explicit [`Attempt`]; the policy decides whether to
//! sleep and go again or give up.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Result of a single try.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    /// Failed, but another try may succeed.
    Retry(E),
    /// Failed in a way retrying cannot fix.
    Abort(E),
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Every allowed attempt returned [`Attempt::Retry`].
    Exhausted { attempts: u32, last: E },
    Aborted { attempt: u32, error: E },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, last } => {
                write!(f, "failed after {attempts} attempts: {last}")
            }
            Self::Aborted { attempt, error } => {
                write!(f, "aborted on attempt {attempt}: {error}")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given (1-based) failed attempt: base, 2·base, 4·base, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }

    /// Run `op` until it succeeds, aborts, or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number. No delay follows the last attempt.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Abort(error) => {
                    warn!("Attempt {attempt}/{} aborted: {error}", self.max_attempts);
                    return Err(RetryError::Aborted { attempt, error });
                }
                Attempt::Retry(error) => {
                    warn!("Attempt {attempt}/{} failed: {error}", self.max_attempts);
                    if attempt >= self.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: error,
                        });
                    }
                    tokio::time::sleep(self.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
