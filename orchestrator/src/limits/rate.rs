//! Token-bucket rate limiter keyed by (actor, route).
//!
//! Buckets are created full and refilled lazily on every check, so there is
//! no background ticker. The read-modify-write for one key happens under the
//! dashmap shard lock, which makes concurrent checks for the same key
//! linearizable. Idle buckets are dropped by [`RateLimiter::evict_idle`]; a
//! key that comes back starts with a full bucket.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::AdmissionError;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    buckets: Arc<DashMap<(String, String), Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one token for `(actor, route)` or deny.
    pub fn check(
        &self,
        actor: &str,
        route: &str,
        rate_per_minute: u32,
        capacity: u32,
    ) -> Result<(), AdmissionError> {
        self.check_at(actor, route, rate_per_minute, capacity, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(
        &self,
        actor: &str,
        route: &str,
        rate_per_minute: u32,
        capacity: u32,
        now: Instant,
    ) -> Result<(), AdmissionError> {
        let capacity = f64::from(capacity);
        let mut bucket = self
            .buckets
            .entry((actor.to_string(), route.to_string()))
            .or_insert(Bucket {
                tokens: capacity,
                last_refill_at: now,
            });

        let elapsed = now
            .saturating_duration_since(bucket.last_refill_at)
            .as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * f64::from(rate_per_minute) / 60.0).min(capacity);
        bucket.last_refill_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        tracing::debug!(actor = %actor, route = %route, "Rate limit exceeded");
        Err(AdmissionError::RateLimited {
            actor: actor.to_string(),
            route: route.to_string(),
        })
    }

    /// Drop buckets not checked within `idle`; returns how many were dropped.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        self.evict_idle_at(idle, Instant::now())
    }

    pub fn evict_idle_at(&self, idle: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill_at) < idle);
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Tokens currently held by a bucket, without refilling it.
    pub fn tokens(&self, actor: &str, route: &str) -> Option<f64> {
        self.buckets
            .get(&(actor.to_string(), route.to_string()))
            .map(|bucket| bucket.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_deny_then_refill_one() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();

        for i in 0..10 {
            assert!(
                limiter.check_at("alice", "runs.start", 60, 10, t0).is_ok(),
                "call {i} should be admitted"
            );
        }
        assert_eq!(
            limiter.check_at("alice", "runs.start", 60, 10, t0),
            Err(AdmissionError::RateLimited {
                actor: "alice".to_string(),
                route: "runs.start".to_string(),
            })
        );

        let t1 = t0 + Duration::from_secs(1);
        assert!(limiter.check_at("alice", "runs.start", 60, 10, t1).is_ok());
        assert!(limiter.check_at("alice", "runs.start", 60, 10, t1).is_err());
    }

    #[test]
    fn test_new_bucket_starts_full() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        assert!(limiter.check_at("bob", "runs.start", 1, 3, now).is_ok());
        assert_eq!(limiter.tokens("bob", "runs.start"), Some(2.0));
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.check_at("carol", "r", 60, 2, t0).is_ok());

        let later = t0 + Duration::from_secs(3600);
        assert!(limiter.check_at("carol", "r", 60, 2, later).is_ok());
        assert_eq!(limiter.tokens("carol", "r"), Some(1.0));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        assert!(limiter.check_at("a", "runs.start", 60, 1, now).is_ok());
        assert!(limiter.check_at("a", "runs.start", 60, 1, now).is_err());
        assert!(limiter.check_at("b", "runs.start", 60, 1, now).is_ok());
        assert!(limiter.check_at("a", "other.route", 60, 1, now).is_ok());
    }

    #[test]
    fn test_idle_buckets_are_evicted() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.check_at("stale", "r", 60, 1, t0).is_ok());
        let t1 = t0 + Duration::from_secs(50 * 60);
        assert!(limiter.check_at("fresh", "r", 60, 1, t1).is_ok());

        let now = t0 + Duration::from_secs(70 * 60);
        assert_eq!(limiter.evict_idle_at(Duration::from_secs(3600), now), 1);
        assert_eq!(limiter.len(), 1);
        assert_eq!(limiter.tokens("stale", "r"), None);
        assert_eq!(limiter.tokens("fresh", "r"), Some(0.0));

        // An evicted key starts over with a full bucket.
        assert!(limiter.check_at("stale", "r", 60, 1, now).is_ok());
    }

    #[test]
    fn test_concurrent_checks_never_overspend() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        let admitted = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        if limiter.check_at("shared", "r", 1, 25, now).is_ok() {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 25);
    }
}
