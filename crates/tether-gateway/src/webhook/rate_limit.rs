//! Per-tenant webhook rate limiting.
//!
//! Token-bucket limiter keyed by `(tenant, source)`: the bucket holds
//! `burstSize` tokens and refills at `requestsPerMinute`. Limits come
//! from each tenant's NamespacePolicy at check time, so a policy update
//! takes effect on the next request.
//!
//! # Memory Management
//!
//! Buckets for idle keys are dropped by periodic cleanup, and a hard cap
//! bounds the number of tracked keys; at the cap, requests for new keys
//! are rejected rather than allowed to grow the map.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use tether_core::error::{Error, Result};
use tether_core::resource::policy::RateLimitSpec;

/// Hard cap on tracked `(tenant, source)` keys.
const MAX_TRACKED_KEYS: usize = 10_000;

/// Buckets idle longer than this are dropped by cleanup.
const IDLE_EVICT_SECS: u64 = 600;

/// How often cleanup runs, counted in checks.
const CLEANUP_INTERVAL: u64 = 512;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter for webhook ingress.
pub struct WebhookRateLimiter {
    buckets: RwLock<HashMap<(String, String), Bucket>>,
    checks: std::sync::atomic::AtomicU64,
}

impl Default for WebhookRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookRateLimiter {
    /// Creates an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            checks: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Admits or rejects one request for `(tenant, source)` under `spec`.
    ///
    /// # Errors
    ///
    /// `RateLimited` when the bucket is empty or the key cap is reached.
    pub fn check(&self, tenant: &str, source: &str, spec: &RateLimitSpec) -> Result<()> {
        let count = self
            .checks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if count > 0 && count % CLEANUP_INTERVAL == 0 {
            self.cleanup();
        }

        let key = (tenant.to_string(), source.to_string());
        let now = Instant::now();
        let refill_per_sec = f64::from(spec.requests_per_minute) / 60.0;
        let capacity = f64::from(spec.burst_size);

        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !buckets.contains_key(&key) && buckets.len() >= MAX_TRACKED_KEYS {
            self.cleanup_locked(&mut buckets);
            if buckets.len() >= MAX_TRACKED_KEYS {
                tracing::warn!(tenant, source, "rate limiter key cap reached");
                return Err(Error::rate_limited("rate limiter capacity exhausted"));
            }
        }

        let bucket = buckets.entry(key).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            tracing::debug!(tenant, source, "webhook rate limit exceeded");
            return Err(Error::rate_limited(format!(
                "tenant {tenant} exceeded {} requests/minute for {source}",
                spec.requests_per_minute
            )));
        }
        bucket.tokens -= 1.0;
        Ok(())
    }

    /// Drops buckets idle past the eviction window.
    pub fn cleanup(&self) {
        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.cleanup_locked(&mut buckets);
    }

    #[allow(clippy::unused_self)]
    fn cleanup_locked(&self, buckets: &mut HashMap<(String, String), Bucket>) {
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.last_refill).as_secs() < IDLE_EVICT_SECS);
    }

    /// Number of tracked keys, for monitoring.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(rpm: u32, burst: u32) -> RateLimitSpec {
        RateLimitSpec {
            requests_per_minute: rpm,
            burst_size: burst,
        }
    }

    #[test]
    fn burst_of_n_is_admitted_and_n_plus_one_is_rejected() {
        let limiter = WebhookRateLimiter::new();
        let spec = spec(60, 5);

        for i in 0..5 {
            assert!(
                limiter.check("team-alpha", "github", &spec).is_ok(),
                "request {i} within burst must pass"
            );
        }
        let err = limiter.check("team-alpha", "github", &spec).unwrap_err();
        assert_eq!(err.kind(), tether_core::ErrorKind::RateLimited);
    }

    #[test]
    fn tenants_and_sources_have_independent_buckets() {
        let limiter = WebhookRateLimiter::new();
        let spec = spec(60, 1);

        assert!(limiter.check("team-alpha", "github", &spec).is_ok());
        assert!(limiter.check("team-alpha", "github", &spec).is_err());
        assert!(limiter.check("team-alpha", "slack", &spec).is_ok());
        assert!(limiter.check("team-beta", "github", &spec).is_ok());
    }

    #[test]
    fn bucket_refills_over_time() {
        let limiter = WebhookRateLimiter::new();
        // 1000 rpm is ~16 tokens/second: refills fast enough to observe.
        let spec = spec(1000, 1);

        assert!(limiter.check("team-alpha", "github", &spec).is_ok());
        assert!(limiter.check("team-alpha", "github", &spec).is_err());
        std::thread::sleep(std::time::Duration::from_millis(120));
        assert!(limiter.check("team-alpha", "github", &spec).is_ok());
    }

    #[test]
    fn cleanup_drops_idle_buckets() {
        let limiter = WebhookRateLimiter::new();
        let spec = spec(60, 5);
        limiter.check("team-alpha", "github", &spec).unwrap();
        assert_eq!(limiter.tracked_keys(), 1);

        // Nothing is idle long enough to evict yet.
        limiter.cleanup();
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
