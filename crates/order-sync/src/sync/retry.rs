//! Exponential backoff policy.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Attempt limit and backoff schedule for transient failures.
///
/// The wait before attempt `n + 1` is `initial * multiplier^(n-1)`, capped at
/// `max_backoff`. A server-provided hint (Retry-After) wins when longer.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `failed_attempt`-th failure (1-based).
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Sleep before the next attempt. Returns false if cancelled while waiting.
    pub async fn wait(
        &self,
        failed_attempt: u32,
        hint: Option<Duration>,
        cancel: &CancellationToken,
    ) -> bool {
        let mut delay = self.backoff_for(failed_attempt);
        if let Some(hint) = hint {
            delay = delay.max(hint.min(self.max_backoff));
        }

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
