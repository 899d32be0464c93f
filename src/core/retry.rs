use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Retry policy for remote inference calls.
///
/// `max_retries` counts retries beyond the first attempt, so the default of 2
/// allows three attempts in total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f32,
    pub jitter_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Check if an HTTP-like status code indicates a transient error
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..=599).contains(&status)
}

/// Computes exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct BackoffCalculator;

impl BackoffCalculator {
    /// Calculate backoff delay for a given attempt index (0-based).
    pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
        let pow = config.backoff_multiplier.powi(attempt as i32);
        let delay_ms = ((config.initial_backoff_ms as f32 * pow) as u64).min(config.max_backoff_ms);

        let jitter = config.jitter_factor.clamp(0.0, 1.0);
        if jitter > 0.0 && delay_ms > 0 {
            let mut rng = rand::rng();
            let jitter_scale: f32 = rng.random_range(-jitter..=jitter);
            let jitter_ms = (delay_ms as f32 * jitter_scale).round();
            let adjusted = (delay_ms as i64 + jitter_ms as i64).max(0) as u64;
            return Duration::from_millis(adjusted);
        }

        Duration::from_millis(delay_ms)
    }
}

#[derive(Debug)]
pub struct MaxRetriesExceeded<T> {
    pub last: T,
    pub attempts: u32,
}

/// Async retry loop shared by every remote call the executor makes.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor;

impl RetryExecutor {
    /// Execute an async operation with retries and backoff.
    ///
    /// Returns `Ok((T, attempts))` when `should_retry` accepts an output, or
    /// `Err(MaxRetriesExceeded)` carrying the last output once every attempt
    /// has been used.
    ///
    /// - `operation(attempt)`: perform one attempt (0-based).
    /// - `should_retry(&output, attempt)`: return true to retry, false to accept.
    /// - `on_backoff(&output, delay, next_attempt)`: called before sleeping between attempts.
    pub async fn execute_with_retry<Op, Fut, T, ShouldRetry, OnBackoff>(
        config: &RetryConfig,
        mut operation: Op,
        should_retry: ShouldRetry,
        on_backoff: OnBackoff,
    ) -> Result<(T, u32), MaxRetriesExceeded<T>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = T>,
        ShouldRetry: Fn(&T, u32) -> bool,
        OnBackoff: Fn(&T, Duration, u32),
    {
        let max = config.total_attempts();
        let mut attempt: u32 = 0;

        loop {
            let output = operation(attempt).await;
            let attempts = attempt + 1;

            if !should_retry(&output, attempt) {
                return Ok((output, attempts));
            }

            if attempts >= max {
                return Err(MaxRetriesExceeded {
                    last: output,
                    attempts,
                });
            }

            let delay = BackoffCalculator::calculate_delay(config, attempt);
            debug!(
                attempt = attempt,
                next_attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Retry backoff"
            );
            on_backoff(&output, delay, attempts);
            tokio::time::sleep(delay).await;

            attempt = attempts;
        }
    }
}
