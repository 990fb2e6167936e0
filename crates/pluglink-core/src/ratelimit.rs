//! Per-connection token-bucket rate limiter.
//!
//! Buckets are created lazily on first use and refill linearly with elapsed
//! time. A consume that cannot be satisfied leaves the bucket untouched, so
//! token counts never go negative.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// Default bucket capacity in tokens.
pub const DEFAULT_BUCKET_CAPACITY: f64 = 100.0;
/// Default refill rate in tokens per second.
pub const DEFAULT_REFILL_PER_SEC: f64 = 10.0;
/// Buckets untouched for this long are dropped by [`TokenBucketRateLimiter::purge_idle`].
pub const DEFAULT_IDLE_AGE: Duration = Duration::from_secs(600);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    last_used: Instant,
}

/// Token-bucket limiter keyed by connection id.
#[derive(Clone)]
pub struct TokenBucketRateLimiter {
    buckets: Arc<Mutex<HashMap<Uuid, Bucket>>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl TokenBucketRateLimiter {
    /// Create a limiter with the default capacity and refill rate.
    pub fn new() -> Self {
        Self::with_rate(DEFAULT_BUCKET_CAPACITY, DEFAULT_REFILL_PER_SEC)
    }

    /// Create a limiter with a custom capacity and refill rate.
    pub fn with_rate(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            capacity,
            refill_per_sec,
        }
    }

    /// Pre-create a bucket with its own capacity and refill rate.
    ///
    /// Used for per-connection rate-limit ceilings supplied at connect time.
    pub async fn configure(&self, connection_id: Uuid, capacity: f64, refill_per_sec: f64) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        buckets.insert(
            connection_id,
            Bucket {
                tokens: capacity,
                capacity,
                refill_per_sec,
                last_refill: now,
                last_used: now,
            },
        );
    }

    /// Try to consume `tokens` for the given connection.
    ///
    /// Refills from elapsed time first, then subtracts if enough tokens are
    /// available. Returns `false` without mutating the count otherwise.
    pub async fn consume(&self, connection_id: Uuid, tokens: f64) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(connection_id).or_insert_with(|| Bucket {
            tokens: self.capacity,
            capacity: self.capacity,
            refill_per_sec: self.refill_per_sec,
            last_refill: now,
            last_used: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.refill_per_sec).min(bucket.capacity);
        bucket.last_refill = now;
        bucket.last_used = now;

        if bucket.tokens >= tokens {
            bucket.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Remaining tokens for a connection, refilled to now. `None` if the
    /// bucket was never created.
    pub async fn available(&self, connection_id: Uuid) -> Option<f64> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.get_mut(&connection_id)?;
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.refill_per_sec).min(bucket.capacity);
        bucket.last_refill = now;
        Some(bucket.tokens)
    }

    /// Drop buckets idle for longer than `max_age`. Returns how many were
    /// removed.
    pub async fn purge_idle(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, b| now.duration_since(b.last_used) <= max_age);
        before - buckets.len()
    }

    /// Number of live buckets.
    pub async fn bucket_count(&self) -> usize {
        self.buckets.lock().await.len()
    }

    /// Remove the bucket for a connection (teardown).
    pub async fn remove(&self, connection_id: Uuid) {
        self.buckets.lock().await.remove(&connection_id);
    }
}

impl Default for TokenBucketRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_consume_within_capacity() {
        let limiter = TokenBucketRateLimiter::with_rate(10.0, 1.0);
        let id = Uuid::new_v4();

        for _ in 0..10 {
            assert!(limiter.consume(id, 1.0).await);
        }
        // Bucket is drained
        assert!(!limiter.consume(id, 1.0).await);
    }

    #[tokio::test]
    async fn test_insufficient_tokens_do_not_mutate() {
        let limiter = TokenBucketRateLimiter::with_rate(5.0, 0.0);
        let id = Uuid::new_v4();

        assert!(limiter.consume(id, 3.0).await);
        let before = limiter.available(id).await.unwrap();
        assert!(!limiter.consume(id, 10.0).await);
        let after = limiter.available(id).await.unwrap();
        assert_eq!(before, after);
        assert!(after >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_refill() {
        let limiter = TokenBucketRateLimiter::with_rate(10.0, 2.0);
        let id = Uuid::new_v4();

        assert!(limiter.consume(id, 10.0).await);
        assert!(!limiter.consume(id, 1.0).await);

        // 2 tokens/sec: after 3s there are ~6 tokens
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(limiter.consume(id, 6.0).await);
        assert!(!limiter.consume(id, 1.0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let limiter = TokenBucketRateLimiter::with_rate(10.0, 100.0);
        let id = Uuid::new_v4();

        assert!(limiter.consume(id, 1.0).await);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available(id).await.unwrap(), 10.0);
    }

    #[tokio::test]
    async fn test_per_connection_ceiling() {
        let limiter = TokenBucketRateLimiter::with_rate(100.0, 10.0);
        let small = Uuid::new_v4();
        limiter.configure(small, 2.0, 0.0).await;

        assert!(limiter.consume(small, 2.0).await);
        assert!(!limiter.consume(small, 1.0).await);

        // Unconfigured connections still get the limiter defaults
        let other = Uuid::new_v4();
        assert!(limiter.consume(other, 50.0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_idle() {
        let limiter = TokenBucketRateLimiter::new();
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();

        limiter.consume(stale, 1.0).await;
        tokio::time::advance(Duration::from_secs(700)).await;
        limiter.consume(fresh, 1.0).await;

        assert_eq!(limiter.purge_idle(DEFAULT_IDLE_AGE).await, 1);
        assert_eq!(limiter.bucket_count().await, 1);
        assert!(limiter.available(stale).await.is_none());
        assert!(limiter.available(fresh).await.is_some());
    }
}
