// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry with exponential backoff.
//!
//! Used by the shard subscriber around the applier and by the snapshot
//! engine around temp-directory cleanup. Retryable-vs-terminal
//! classification stays with the caller; this module only paces attempts.

use std::time::Duration;
use tracing::{debug, warn};

/// Retry pacing parameters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Pacing for the apply path: a handful of quick attempts so a busy
    /// database gets a chance without stalling the shard for long.
    pub fn applier() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }

    /// Pacing for filesystem cleanup: slower, fewer attempts.
    pub fn cleanup() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
        }
    }

    /// Delay before attempt `n + 1` (0-based failures so far).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.min(16);
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max_delay)
    }
}

/// Run an async operation under a retry budget.
///
/// Retries while `should_retry` returns true for the error and attempts
/// remain; the final error is returned unchanged.
pub async fn retry_async<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut f: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut failures = 0u32;
    loop {
        match f().await {
            Ok(value) => {
                if failures > 0 {
                    debug!(
                        operation = operation_name,
                        attempts = failures + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(e) if should_retry(&e) && failures + 1 < config.max_attempts => {
                let delay = config.delay_for(failures);
                warn!(
                    operation = operation_name,
                    attempt = failures + 1,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                failures += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
