// # Retry Decorator
//
// Exponential backoff with optional jitter around async operations. Only
// errors the predicate accepts are consumed; everything else propagates
// immediately. On exhaustion the last error surfaces wrapped with the
// ATTEMPTS_EXHAUSTED tag so callers can still route on the underlying kind.

use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Backoff tuning shared by the pool, the client layer and the reconnect
/// supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay: Duration,

    /// Multiplier applied per attempt
    pub factor: f64,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Random jitter window as a fraction of the delay (0.2 = +/-20%)
    pub jitter: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: Some(0.2),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DbError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.factor < 1.0 {
            return Err(DbError::Configuration(
                "backoff factor must be >= 1.0".to_string(),
            ));
        }
        if let Some(j) = self.jitter {
            if !(0.0..=1.0).contains(&j) {
                return Err(DbError::Configuration(
                    "jitter must be within [0.0, 1.0]".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Delay before the given attempt (1-indexed; attempt 1 has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(63);
        let raw = self.base_delay.as_secs_f64() * self.factor.powi(exp as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jittered = match self.jitter {
            Some(window) if window > 0.0 => {
                let spread = (fastrand::f64() * 2.0 - 1.0) * window;
                (capped * (1.0 + spread)).max(0.0)
            }
            _ => capped,
        };
        Duration::from_secs_f64(jittered)
    }
}

/// Retry an operation, consuming errors that `DbError::is_retryable` accepts.
pub async fn retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(config, DbError::is_retryable, operation).await
}

/// Retry an operation with a caller-supplied retryable predicate.
pub async fn retry_if<T, F, Fut, P>(
    config: &RetryConfig,
    retryable: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&DbError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if matches!(e, DbError::Cancelled(_)) => return Err(e),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) if attempt >= config.max_attempts => {
                tracing::warn!(
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %e,
                    "retry attempts exhausted"
                );
                return Err(DbError::AttemptsExhausted {
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let delay = config.delay_for_attempt(attempt + 1);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
