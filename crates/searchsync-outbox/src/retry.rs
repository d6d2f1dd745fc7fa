//! Retry budget and backoff curve for failed events.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use searchsync_storage::FailureAction;
use searchsync_types::{OutboxEvent, PollingSettings};

/// Decides what happens to an event after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&PollingSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &PollingSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.retry_initial_delay_ms),
            multiplier: settings.retry_multiplier,
            max_delay: Duration::from_millis(settings.retry_max_delay_ms),
        }
    }

    /// Exponential curve without jitter, never giving up.
    pub fn backoff(&self) -> ExponentialBackoff {
        exponential(self.initial_delay, self.multiplier, self.max_delay)
    }

    /// Delay before attempt `failures + 1`, given `failures` so far (>= 1).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let mut backoff = self.backoff();
        let mut delay = self.initial_delay;
        for _ in 0..failures.max(1) {
            delay = backoff.next_backoff().unwrap_or(self.max_delay);
        }
        delay
    }

    /// Action for `event` (as claimed) whose current attempt just failed.
    ///
    /// The attempt is counted first; once more than `max_retries` attempts
    /// have failed within the current budget the event is aborted.
    pub fn decide(&self, event: &OutboxEvent, now: DateTime<Utc>) -> FailureAction {
        let failures = event.budgeted_retries() + 1;
        if failures > self.max_retries {
            return FailureAction::Abort;
        }
        let delay = chrono::Duration::milliseconds(self.delay_for(failures).as_millis() as i64);
        FailureAction::RetryAt(now + delay)
    }
}

/// Exponential backoff with no randomization and no elapsed-time limit.
pub(crate) fn exponential(initial: Duration, multiplier: f64, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        randomization_factor: 0.0,
        multiplier,
        max_interval: max,
        max_elapsed_time: None,
        ..Default::default()
    }
}
