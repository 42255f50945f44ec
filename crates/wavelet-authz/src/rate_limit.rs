use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

struct Window {
    count: u32,
    reset_at: i64,
}

/// A fixed-window `(userId, route)` limiter. State is owned by the
/// middleware factory, not shared across replicas — intentionally local;
/// a distributed limiter is future work, not something this layer pretends
/// to provide.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    buckets: Mutex<HashMap<(String, String), Window>>,
    last_sweep_ms: AtomicI64,
    sweep_interval_ms: i64,
}

pub struct RateLimitOutcome {
    pub allowed: bool,
    pub retry_after_ms: u64,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: Mutex::new(HashMap::new()),
            last_sweep_ms: AtomicI64::new(now_millis()),
            sweep_interval_ms: Duration::from_secs(300).as_millis() as i64,
        }
    }

    pub async fn check(&self, user_id: &str, route: &str) -> RateLimitOutcome {
        let now = now_millis();
        self.sweep_if_due(now).await;

        let mut buckets = self.buckets.lock().await;
        let key = (user_id.to_string(), route.to_string());
        let window_ms = self.window.as_millis() as i64;

        let entry = buckets.entry(key).or_insert_with(|| Window {
            count: 0,
            reset_at: now + window_ms,
        });

        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + window_ms;
        }

        if entry.count >= self.limit {
            return RateLimitOutcome {
                allowed: false,
                retry_after_ms: (entry.reset_at - now).max(0) as u64,
            };
        }

        entry.count += 1;
        RateLimitOutcome {
            allowed: true,
            retry_after_ms: 0,
        }
    }

    /// Cleanup is lazy on access: once `sweep_interval_ms` has elapsed since
    /// the last sweep, the next `check` call pays the cost of clearing
    /// expired buckets instead of a dedicated background task.
    async fn sweep_if_due(&self, now: i64) {
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now - last < self.sweep_interval_ms {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|_, window| window.reset_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_the_limit_then_denies() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("u1", "POST /messages").await.allowed);
        assert!(limiter.check("u1", "POST /messages").await.allowed);
        let third = limiter.check("u1", "POST /messages").await;
        assert!(!third.allowed);
        assert!(third.retry_after_ms > 0);
    }

    #[tokio::test]
    async fn buckets_are_independent_per_user_and_route() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("u1", "POST /messages").await.allowed);
        assert!(limiter.check("u2", "POST /messages").await.allowed);
        assert!(limiter.check("u1", "GET /conversations").await.allowed);
    }
}
