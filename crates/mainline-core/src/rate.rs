use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed-window request budget per key (route + peer).
///
/// Exceeding the budget yields the number of seconds the caller should wait
/// (`Retry-After`), which is the window length rounded up to whole seconds.
pub struct RateLimiter {
    max: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    count: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(max: u32, window_ms: u64) -> Self {
        Self {
            max,
            window: Duration::from_millis(window_ms),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Ok when the request fits the budget, Err(retry_after_secs) otherwise.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Opportunistic cleanup keeps one-shot peers from accumulating.
        buckets.retain(|_, b| now.duration_since(b.window_start) < self.window);

        let bucket = buckets
            .entry(key.to_string())
            .or_insert(Bucket { count: 0, window_start: now });
        if now.duration_since(bucket.window_start) >= self.window {
            bucket.count = 0;
            bucket.window_start = now;
        }
        if bucket.count >= self.max {
            return Err(self.retry_after_secs());
        }
        bucket.count += 1;
        Ok(())
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.window.as_millis().div_ceil(1_000) as u64
    }
}
