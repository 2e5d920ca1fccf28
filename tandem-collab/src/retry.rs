//! Capped exponential backoff.
//!
//! [`RetryPolicy`] bounds server-side retries of durable appends;
//! [`Backoff`] paces client reconnects and never gives up.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Bounded retry schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5),
        }
    }

    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        capped_exponential(self.initial_delay, self.multiplier, self.max_delay, attempt)
    }
}

/// Unbounded reconnect schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn for_testing() -> Self {
        Self {
            initial: Duration::from_millis(10),
            multiplier: 2.0,
            max: Duration::from_millis(100),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        capped_exponential(self.initial, self.multiplier, self.max, attempt)
    }
}

fn capped_exponential(initial: Duration, multiplier: f64, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.min(64) as i32;
    let secs = initial.as_secs_f64() * multiplier.powi(exponent);
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// All attempts failed; carries the last error.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gave up after {} attempts: {}", self.attempts, self.last_error)
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for RetryExhausted<E> {}

/// Run `operation` until it succeeds or the policy runs out. Each attempt
/// is a fresh future, awaited before the next delay.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(RetryExhausted { attempts: attempt, last_error: e });
                }
                let delay = policy.delay(attempt - 1);
                log::warn!("Attempt {attempt}/{max_attempts} failed: {e}; retrying in {delay:?}");
                sleep(delay).await;
            }
        }
    }
}
