//! Retry scheduling for failed job executions.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// How many times a failed job is attempted again, and when.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// The first failure halts the pipeline.
    #[default]
    None,

    /// Every retry waits the same delay.
    Fixed {
        /// Retries allowed after the first attempt.
        max_retries: u32,
        delay: Duration,
    },

    /// Delay doubles with each retry up to `max_delay`.
    Exponential {
        /// Retries allowed after the first attempt.
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
    },
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::Fixed { max_retries, delay }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_retries, .. } | Self::Exponential { max_retries, .. } => *max_retries,
        }
    }

    /// Delay before retry number `retry` (1-indexed) becomes eligible, or
    /// `None` once the budget is spent.
    pub fn delay_for_retry(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries() {
            return None;
        }
        match self {
            Self::None => None,
            Self::Fixed { delay, .. } => Some(*delay),
            Self::Exponential {
                initial_delay,
                max_delay,
                ..
            } => {
                let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
                let delay = initial_delay.checked_mul(factor).unwrap_or(*max_delay);
                Some(delay.min(*max_delay))
            }
        }
    }

    /// Moment retry number `retry` becomes claimable when the failure
    /// happened at `failed_at`.
    pub fn eligible_at(&self, retry: u32, failed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delay = self.delay_for_retry(retry)?;
        let eligible = TimeDelta::from_std(delay)
            .ok()
            .and_then(|delta| failed_at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(eligible)
    }
}
