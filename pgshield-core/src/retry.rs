//! Deadlock retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GuardError, GuardResult};

/// Configuration for deadlock retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on the exponential part of the delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Whether to add jitter in `[0, base_delay)`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum retries.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Set the base delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay before retry number `attempt` (starting at 1).
    ///
    /// `base * 2^(attempt-1)`, capped at `max_delay`, plus jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let backoff = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);

        let jitter = if self.jitter {
            (self.base_delay_ms as f64 * rand_jitter()) as u64
        } else {
            0
        };

        Duration::from_millis(backoff + jitter)
    }
}

/// Pseudo-random value in `[0, 1)`.
fn rand_jitter() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    let hash = hasher.finish();
    (hash % 1000) as f64 / 1000.0
}

/// A value produced under retry, with the number of retries it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    /// The operation's result.
    pub value: T,
    /// Retries performed before it succeeded.
    pub retry_count: u32,
}

/// Run `operation`, retrying deadlocks and serialization failures.
///
/// Other errors propagate on first occurrence. When retries run out the last
/// deadlock is returned as [`GuardError::DeadlockExhausted`].
pub async fn retry_on_deadlock<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut operation: F,
) -> GuardResult<Retried<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GuardResult<T>>,
{
    let mut retries = 0u32;
    loop {
        match operation().await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    retry_count: retries,
                });
            }
            Err(GuardError::Transaction { source, .. }) if source.kind.is_retryable() => {
                if retries >= config.max_retries {
                    warn!(operation = label, retries, "Deadlock retries exhausted");
                    return Err(GuardError::DeadlockExhausted { retries, source });
                }
                retries += 1;
                let delay = config.delay_for_attempt(retries);
                warn!(
                    operation = label,
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %source,
                    "Deadlock detected, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
