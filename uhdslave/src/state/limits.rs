// uhdslave/src/state/limits.rs
//
// Local rate-limit counters.
//
// Per-second limits are proper token buckets: capacity `burst` (default =
// rate), refilled continuously at `rate` tokens/sec. Per-minute limits are
// fixed 60-second windows. Both live in sharded maps keyed by
// `{rule_id}:{dimension}:{value}` and are intentionally per-instance —
// cross-instance fairness comes from quotas and enforcement directives, not
// from these counters.
//
// No await points: bucket state sits behind parking_lot mutexes inside a
// DashMap shard.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

const BUCKET_IDLE_EVICT: Duration = Duration::from_secs(120);
const HOUSEKEEPING_EVERY: Duration = Duration::from_secs(60);

struct Bucket {
    tokens:    f64,
    capacity:  f64,
    rate:      f64,
    last_seen: Instant,
}

impl Bucket {
    fn new(rate: u32, burst: u32, now: Instant) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            rate: rate.max(1) as f64,
            last_seen: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_seen).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_seen = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct RpmWindow {
    window: i64,
    count:  u32,
}

pub struct LocalLimits {
    buckets: DashMap<String, Mutex<Bucket>>,
    windows: DashMap<String, Mutex<RpmWindow>>,
}

impl LocalLimits {
    pub fn new() -> Self {
        Self { buckets: DashMap::new(), windows: DashMap::new() }
    }

    /// Take one token from the bucket for `key`. A fresh bucket starts full,
    /// so the first `burst` requests of a quiet period always pass.
    pub fn check_rps(&self, key: &str, rate: u32, burst: u32) -> bool {
        let now = Instant::now();
        let entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Bucket::new(rate, burst, now)));
        let mut bucket = entry.lock();
        // Rule changed out from under the bucket — rebuild it
        if bucket.rate != rate.max(1) as f64 || bucket.capacity != burst.max(1) as f64 {
            *bucket = Bucket::new(rate, burst, now);
        }
        bucket.try_take(now)
    }

    /// Fixed 60-second window counter: `limit` requests per window, counted
    /// from the first observation in that window.
    pub fn check_rpm(&self, key: &str, limit: u32, now_unix: i64) -> bool {
        let window = now_unix.div_euclid(60);
        let entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(RpmWindow { window, count: 0 }));
        let mut w = entry.lock();
        if w.window != window {
            w.window = window;
            w.count = 0;
        }
        w.count = w.count.saturating_add(1);
        w.count <= limit
    }

    pub fn prune(&self) {
        let now = Instant::now();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.lock().last_seen) < BUCKET_IDLE_EVICT);
        let current_window = chrono::Utc::now().timestamp().div_euclid(60);
        self.windows.retain(|_, w| current_window - w.lock().window <= 1);
    }

    pub async fn housekeeping_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(HOUSEKEEPING_EVERY).await;
            self.prune();
        }
    }
}

impl Default for LocalLimits {
    fn default() -> Self {
        Self::new()
    }
}
