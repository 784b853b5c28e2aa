// # Rate Limiter
//
// Sliding-window counters keyed by principal (and optionally tool), used by
// the safety controller and the tool registry. Windows are pruned lazily on
// check, so idle keys cost nothing.

use crate::error::{DbError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls allowed per window per key
    pub max_calls: u32,

    /// Window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 60,
            window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window limiter. Thread-safe, shared as a plain reference.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Mutex<VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Record one call under `key`, failing with RATE_LIMITED when the
    /// window is saturated. Uses the limiter's configured ceiling.
    pub fn check(&self, key: &str) -> Result<()> {
        self.check_with_limit(key, self.config.max_calls)
    }

    /// Record one call with a per-call ceiling (tool descriptors carry
    /// their own limits).
    pub fn check_with_limit(&self, key: &str, max_calls: u32) -> Result<()> {
        let now = Instant::now();
        let entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut window = entry.lock();
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= self.config.window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() as u32 >= max_calls {
            return Err(DbError::RateLimited(format!(
                "'{}' exceeded {} calls per {:?}",
                key, max_calls, self.config.window
            )));
        }
        window.push_back(now);
        Ok(())
    }

    /// Calls currently counted in `key`'s window.
    pub fn current(&self, key: &str) -> usize {
        self.windows.get(key).map(|w| w.lock().len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_ceiling_within_window() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_calls: 3,
            window: Duration::from_secs(60),
        });
        for _ in 0..3 {
            limiter.check("alice").unwrap();
        }
        let err = limiter.check("alice").unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
        // Other keys are unaffected.
        limiter.check("bob").unwrap();
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_calls: 2,
            window: Duration::from_millis(30),
        });
        limiter.check("k").unwrap();
        limiter.check("k").unwrap();
        assert!(limiter.check("k").is_err());
        std::thread::sleep(Duration::from_millis(40));
        limiter.check("k").unwrap();
        assert_eq!(limiter.current("k"), 1);
    }

    #[test]
    fn per_call_limits_override() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        limiter.check_with_limit("tool", 1).unwrap();
        assert!(limiter.check_with_limit("tool", 1).is_err());
    }
}
