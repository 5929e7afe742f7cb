//! Retry policy: exponential backoff shared by every channel kind.

use crate::config::RetrySettings;
use std::time::Duration;

/// Attempt N (0-indexed) waits `initial_delay * 2^N`; a job is dropped once its
/// retry count reaches `max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_retries,
            Duration::from_secs(settings.initial_delay_seconds),
        )
    }

    /// Backoff before re-submitting a job that has already been retried `retry_count` times.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(retry_count))
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}
