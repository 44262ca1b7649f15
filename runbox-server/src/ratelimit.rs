//! Per-tenant token-bucket admission control
//!
//! One bucket per API key, refilled continuously: `elapsed * rate` tokens up
//! to `burst`. An admission costs one token; a rejected admission still
//! advances the bucket state. Process-local only — there is no cross-process
//! coordination.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;

use runbox_core::{Error, Result};

use crate::auth::Tenant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or reject one request for the tenant.
    pub async fn check(&self, tenant: &Tenant) -> Result<()> {
        self.check_at(tenant, Instant::now()).await
    }

    async fn check_at(&self, tenant: &Tenant, now: Instant) -> Result<()> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(tenant.token.clone()).or_insert(Bucket {
            tokens: tenant.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * tenant.rate).min(tenant.burst);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            return Err(Error::TooManyRequests);
        }
        bucket.tokens -= 1.0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tenant(rate: f64, burst: f64) -> Tenant {
        Tenant {
            token: "tok_test".to_string(),
            label: "test".to_string(),
            rate,
            burst,
        }
    }

    #[tokio::test]
    async fn test_burst_then_reject() {
        let limiter = RateLimiter::new();
        let tenant = tenant(5.0, 5.0);
        let now = Instant::now();
        for _ in 0..5 {
            limiter.check_at(&tenant, now).await.unwrap();
        }
        assert!(matches!(
            limiter.check_at(&tenant, now).await,
            Err(Error::TooManyRequests)
        ));
    }

    #[tokio::test]
    async fn test_refill_after_wait() {
        let limiter = RateLimiter::new();
        let tenant = tenant(5.0, 5.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.check_at(&tenant, start).await.unwrap();
        }
        assert!(limiter.check_at(&tenant, start).await.is_err());

        // 1 second at 5 rps refills five tokens
        let later = start + Duration::from_secs(1);
        for _ in 0..5 {
            limiter.check_at(&tenant, later).await.unwrap();
        }
        assert!(limiter.check_at(&tenant, later).await.is_err());
    }

    #[tokio::test]
    async fn test_refill_caps_at_burst() {
        let limiter = RateLimiter::new();
        let tenant = tenant(100.0, 2.0);
        let start = Instant::now();
        limiter.check_at(&tenant, start).await.unwrap();

        // long idle refills to burst, not beyond
        let later = start + Duration::from_secs(60);
        limiter.check_at(&tenant, later).await.unwrap();
        limiter.check_at(&tenant, later).await.unwrap();
        assert!(limiter.check_at(&tenant, later).await.is_err());
    }

    #[tokio::test]
    async fn test_buckets_are_per_key() {
        let limiter = RateLimiter::new();
        let a = Tenant {
            token: "tok_a".to_string(),
            ..tenant(1.0, 1.0)
        };
        let b = Tenant {
            token: "tok_b".to_string(),
            ..tenant(1.0, 1.0)
        };
        let now = Instant::now();
        limiter.check_at(&a, now).await.unwrap();
        assert!(limiter.check_at(&a, now).await.is_err());
        limiter.check_at(&b, now).await.unwrap();
    }
}
