//! Bounded retry with exponential backoff for Spotify calls.

use super::error::SpotifyError;
use crate::config::RetrySettings;
use crate::metrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Cap for both exponential growth and server-provided `Retry-After` values.
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (0-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let max = self.max_backoff.as_secs_f64();
        let backoff =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(retry as i32);
        if !backoff.is_finite() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(backoff.clamp(0.0, max))
    }

    /// Whether a call that failed with `error` on attempt `attempt` (1-based)
    /// should be attempted again.
    pub fn should_retry(&self, error: &SpotifyError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    fn delay_for(&self, error: &SpotifyError, retry: u32) -> Duration {
        if let SpotifyError::RateLimited(Some(retry_after)) = error {
            return (*retry_after).min(self.max_backoff);
        }
        let base = self.backoff(retry);
        let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or runs out
    /// of attempts. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, SpotifyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SpotifyError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(&e, attempt) => {
                    let delay = self.delay_for(&e, attempt - 1);
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        operation, attempt, self.max_attempts, e, delay
                    );
                    metrics::EXTERNAL_RETRIES_TOTAL
                        .with_label_values(&[operation])
                        .inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}
