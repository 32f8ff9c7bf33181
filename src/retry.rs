// ABOUTME: Retry policy for whole replication attempts and the injectable clock it sleeps on
// ABOUTME: SystemClock is used in production; tests substitute a clock that never sleeps

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use std::time::Duration;

/// Source of wall-clock time and sleeps.
///
/// The driver reads "today" from here to compute the partition cutoff and
/// sleeps between attempts through it.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every failed attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Stop retrying once this much time has passed since the first attempt.
    pub max_elapsed: Option<Duration>,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            max_elapsed: None,
            backoff: Backoff::Fixed(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            ..Self::default()
        }
    }

    /// Whether another attempt may start after `attempts_made` failures.
    pub fn should_retry(&self, attempts_made: u32, elapsed: Duration) -> bool {
        if let Some(max) = self.max_attempts {
            if attempts_made >= max {
                return false;
            }
        }
        match self.max_elapsed {
            Some(limit) => elapsed < limit,
            None => true,
        }
    }

    /// Delay before the attempt that follows `attempts_made` failures.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { initial, max } => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                initial
                    .checked_mul(1u32 << exponent)
                    .map_or(*max, |d| d.min(*max))
            }
        }
    }
}
