//! Fixed-window request counter per client.
//!
//! Windows are aligned to wall-clock minutes: every request in the same
//! 60-second window `[t - t % 60, t - t % 60 + 60)` counts against the same
//! bucket, and the count resets at the boundary.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::RagError;

const WINDOW_SECS: u64 = 60;

/// Result of an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub limit: u32,
    pub remaining: u32,
    /// Unix time at which the current window ends.
    pub reset_at: u64,
}

struct Bucket {
    window_start: u64,
    count: u32,
}

pub struct RateLimiter {
    limit: u32,
    enabled: bool,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(limit: u32, enabled: bool) -> Self {
        Self {
            limit: limit.max(1),
            enabled,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn check(&self, client: &str) -> Result<Admission, RagError> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.check_at(client, now)
    }

    /// Counts one request from `client` at Unix time `now`.
    pub fn check_at(&self, client: &str, now: u64) -> Result<Admission, RagError> {
        let window_start = now - now % WINDOW_SECS;
        let reset_at = window_start + WINDOW_SECS;
        if !self.enabled {
            return Ok(Admission {
                limit: self.limit,
                remaining: self.limit,
                reset_at,
            });
        }

        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Buckets from earlier windows can never count again.
        if buckets.len() > 1024 {
            buckets.retain(|_, b| b.window_start == window_start);
        }

        let bucket = buckets.entry(client.to_string()).or_insert(Bucket {
            window_start,
            count: 0,
        });
        if bucket.window_start != window_start {
            bucket.window_start = window_start;
            bucket.count = 0;
        }

        if bucket.count >= self.limit {
            tracing::warn!(client, limit = self.limit, "rate limit exceeded");
            return Err(RagError::RateLimited {
                retry_after_secs: (reset_at - now).max(1),
            });
        }
        bucket.count += 1;

        Ok(Admission {
            limit: self.limit,
            remaining: self.limit - bucket.count,
            reset_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_then_reject() {
        let limiter = RateLimiter::new(2, true);
        let t = 1_700_000_000;
        assert_eq!(limiter.check_at("a", t).unwrap().remaining, 1);
        assert_eq!(limiter.check_at("a", t + 1).unwrap().remaining, 0);
        let err = limiter.check_at("a", t + 2).unwrap_err();
        assert!(matches!(err, RagError::RateLimited { .. }));
    }

    #[test]
    fn test_exactly_one_rejection_for_n_plus_one() {
        let limiter = RateLimiter::new(5, true);
        let start = 1_700_000_040 - 1_700_000_040 % 60;
        let rejected = (0..6)
            .filter(|i| limiter.check_at("client", start + i).is_err())
            .count();
        assert_eq!(rejected, 1);
    }

    #[test]
    fn test_window_reset_and_retry_after() {
        let limiter = RateLimiter::new(1, true);
        let window = 1_700_000_000 - 1_700_000_000 % 60;
        limiter.check_at("a", window + 10).unwrap();
        match limiter.check_at("a", window + 50) {
            Err(RagError::RateLimited { retry_after_secs }) => assert_eq!(retry_after_secs, 10),
            other => panic!("expected rate limit, got {:?}", other),
        }
        assert!(limiter.check_at("a", window + 60).is_ok());
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::new(1, true);
        assert!(limiter.check_at("a", 100).is_ok());
        assert!(limiter.check_at("b", 100).is_ok());
        assert!(limiter.check_at("a", 101).is_err());
    }

    #[test]
    fn test_disabled_never_rejects() {
        let limiter = RateLimiter::new(1, false);
        for i in 0..10 {
            assert!(limiter.check_at("a", 1000 + i).is_ok());
        }
    }
}
