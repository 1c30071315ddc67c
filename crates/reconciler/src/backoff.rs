//! Retry budgets and backoff.
//!
//! A record is re-examined after `check_interval × delay_rate`, where the
//! delay rate grows with how long the provider took to answer last time:
//! `delay_rate = min(max_delay_rate, 1 + duration / threshold)`. Fatal
//! errors stretch the delay by a further multiplier.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::DeletionConfig;

/// Budgets and delay parameters, derived once from a [`DeletionConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    check_interval: Duration,
    delay_threshold: Duration,
    max_delay_rate: f64,
    fatal_multiplier: u32,
    max_retryable: u32,
    max_fatal: u32,
    retries_to_retry: u32,
}

impl RetryPolicy {
    /// Build the policy from a validated config.
    pub fn from_config(config: &DeletionConfig) -> Self {
        Self {
            check_interval: config.check_interval(),
            delay_threshold: config.operation_delay_threshold(),
            max_delay_rate: config.max_delay_rate,
            fatal_multiplier: config.fatal_error_interval_multiplier,
            max_retryable: config.max_retryable_error_retries,
            max_fatal: config.max_fatal_error_retries,
            retries_to_retry: config.retries_to_retry,
        }
    }

    /// Slowdown factor for the next check, in `[1, max_delay_rate]`.
    pub fn delay_rate(&self, last_duration: Duration) -> f64 {
        let threshold = self.delay_threshold.as_secs_f64();
        if threshold <= 0.0 {
            return self.max_delay_rate;
        }
        (1.0 + last_duration.as_secs_f64() / threshold).min(self.max_delay_rate)
    }

    /// Delay before the next check.
    pub fn next_delay(&self, last_duration: Duration, fatal: bool) -> Duration {
        let delay = self.check_interval.mul_f64(self.delay_rate(last_duration));
        if fatal {
            delay.saturating_mul(self.fatal_multiplier)
        } else {
            delay
        }
    }

    /// Instant of the next check, counted from `now`.
    pub fn next_check(
        &self,
        now: DateTime<Utc>,
        last_duration: Duration,
        fatal: bool,
    ) -> DateTime<Utc> {
        chrono::Duration::from_std(self.next_delay(last_duration, fatal))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Longest delay the policy can produce.
    pub fn max_delay(&self, fatal: bool) -> Duration {
        let delay = self.check_interval.mul_f64(self.max_delay_rate);
        if fatal {
            delay.saturating_mul(self.fatal_multiplier)
        } else {
            delay
        }
    }

    /// True once `retries` exceeds the retryable budget.
    pub fn retryable_exhausted(&self, retries: u32) -> bool {
        retries > self.max_retryable
    }

    /// True once `fatal_retries` exceeds the fatal budget.
    pub fn fatal_exhausted(&self, fatal_retries: u32) -> bool {
        fatal_retries > self.max_fatal
    }

    /// True once enough polls failed that the operation must be re-issued.
    pub fn should_reissue(&self, retries_to_retry: u32) -> bool {
        retries_to_retry > self.retries_to_retry
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeletionConfig::default())
    }
}

/// Measures the wall time of one provider call.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionTimer {
    started: Instant,
}

impl ExecutionTimer {
    /// Start timing now.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Time since the timer started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Delay rate the elapsed time would produce under `policy`.
    pub fn delay_rate(&self, policy: &RetryPolicy) -> f64 {
        policy.delay_rate(self.elapsed())
    }
}
