//! Retry strategies for operations against a live process.
//!
//! Memory reads against a running target fail transiently while pages are
//! being committed or protections are flipped. Callers pick a strategy and
//! drive it through [`retry`].

use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::config::memory::{MAX_READ_ATTEMPTS, TIME_BETWEEN_READ_ATTEMPTS};

/// Decides whether and when another attempt is made.
pub trait RetryStrategy: Send + Sync {
    /// Delay before attempt number `attempt` (1-based, counting the failed
    /// attempts so far), or `None` to give up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Fixed number of attempts with a constant delay between them.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl FixedDelay {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self::new(MAX_READ_ATTEMPTS, TIME_BETWEEN_READ_ATTEMPTS)
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then_some(self.delay)
    }
}

/// Doubling delay, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        Some(
            self.initial_delay
                .saturating_mul(factor)
                .min(self.max_delay),
        )
    }
}

/// Single attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Run `op` until it succeeds or the strategy gives up; the last error is
/// returned.
pub fn retry<T, E, F>(strategy: &dyn RetryStrategy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => match strategy.next_delay(attempt) {
                Some(delay) => {
                    trace!("attempt {} failed, retrying in {:?}", attempt, delay);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                None => return Err(e),
            },
        }
    }
}
