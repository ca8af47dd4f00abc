//! Per-store request budget for outbound platform API calls.

use log::{debug, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    /// May go negative: callers reserve a token and then wait for it.
    tokens: f64,
    refilled_at: Instant,
    paused_until: Option<Instant>,
}

/// Token bucket per store, shared by every pull worker of that store.
///
/// Waiting happens outside the lock; the lock only guards the reservation.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    pause_ceiling: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, pause_ceiling: Duration) -> Self {
        let per_minute = f64::from(requests_per_minute.max(1));
        Self {
            capacity: per_minute,
            refill_per_sec: per_minute / 60.0,
            pause_ceiling,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Waits until a request for `store_id` fits the budget. Returns the time waited.
    pub async fn acquire(&self, store_id: &str) -> Duration {
        let wait = self.reserve(store_id).await;
        if !wait.is_zero() {
            self.log_pause(store_id, wait, "budget exhausted");
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Blocks the store's budget for `duration` after a 429 from the platform.
    pub async fn pause(&self, store_id: &str, duration: Duration) {
        let now = Instant::now();
        let until = now + duration;
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(store_id.to_string())
            .or_insert_with(|| Bucket {
                tokens: self.capacity,
                refilled_at: now,
                paused_until: None,
            });
        bucket.tokens = bucket.tokens.min(0.0);
        bucket.refilled_at = now;
        bucket.paused_until = Some(match bucket.paused_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        drop(buckets);
        self.log_pause(store_id, duration, "platform quota exceeded");
    }

    async fn reserve(&self, store_id: &str) -> Duration {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(store_id.to_string())
            .or_insert_with(|| Bucket {
                tokens: self.capacity,
                refilled_at: now,
                paused_until: None,
            });

        if let Some(until) = bucket.paused_until {
            if until > now {
                // No refill while paused; the deficit is paid after the pause.
                bucket.tokens -= 1.0;
                return (until - now) + self.deficit_wait(bucket.tokens);
            }
            bucket.paused_until = None;
            bucket.refilled_at = bucket.refilled_at.max(until);
        }

        if now > bucket.refilled_at {
            let elapsed = (now - bucket.refilled_at).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            bucket.refilled_at = now;
        }

        bucket.tokens -= 1.0;
        self.deficit_wait(bucket.tokens)
    }

    fn deficit_wait(&self, tokens: f64) -> Duration {
        if tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-tokens / self.refill_per_sec)
        }
    }

    fn log_pause(&self, store_id: &str, wait: Duration, reason: &str) {
        if wait > self.pause_ceiling {
            warn!(
                "[RateLimiter] Pausing store {} for {:?} ({})",
                store_id, wait, reason
            );
        } else {
            debug!(
                "[RateLimiter] Pausing store {} for {:?} ({})",
                store_id, wait, reason
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn budget_is_spent_then_refilled() {
        let limiter = RateLimiter::new(60, Duration::from_secs(60));
        for _ in 0..60 {
            assert_eq!(limiter.acquire("s1").await, Duration::ZERO);
        }
        let waited = limiter.acquire("s1").await;
        assert_eq!(waited, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stores_have_independent_budgets() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert_eq!(limiter.acquire("s1").await, Duration::ZERO);
        assert_eq!(limiter.acquire("s2").await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_delays_the_next_request() {
        let limiter = RateLimiter::new(600, Duration::from_secs(60));
        limiter.pause("s1", Duration::from_secs(30)).await;
        let start = Instant::now();
        let waited = limiter.acquire("s1").await;
        assert!(waited >= Duration::from_secs(30));
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
