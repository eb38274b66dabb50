//! Rate-limit classification and the bounded retry policy.
//!
//! Retries are fixed-delay and capped: provider per-user quota windows reset
//! on a fixed cadence, so only throttling errors are retried and everything
//! else propagates on the first failure.

use std::future::Future;
use std::time::Duration;

use super::{ProviderError, Result};
use crate::config::RetrySettings;

/// 403 reasons that signal quota exhaustion rather than a permission problem.
pub const QUOTA_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "quotaExceeded",
    "dailyLimitExceeded",
    "limitExceeded",
];

/// Returns true when the error is provider throttling.
///
/// Matches HTTP 429, or 403 with a quota reason. Envelope wrapping is looked
/// through. Timeouts are never rate limits.
pub fn is_rate_limit(err: &ProviderError) -> bool {
    match err.root() {
        ProviderError::RateLimited { .. } => true,
        ProviderError::Api { status: 429, .. } => true,
        ProviderError::Api {
            status: 403,
            reason: Some(reason),
            ..
        } => QUOTA_REASONS.contains(&reason.as_str()),
        _ => false,
    }
}

/// Fixed-delay retry policy for rate-limited operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` counts the first call; zero is treated as one.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Maximum number of calls, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay between attempts.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Runs `op`, retrying while it fails with a rate limit.
    ///
    /// Any other error, or the final rate-limit error once the attempt
    /// ceiling is reached, is returned without further delay.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_rate_limit(&err) && attempt < self.max_attempts => {
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = self.delay.as_millis() as u64,
                        "rate limited, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if is_rate_limit(&err) {
                        tracing::error!(operation, attempts = attempt, "retry budget exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.delay_ms),
        )
    }
}
