use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Per-account token bucket for inbound requests.
///
/// A rejected request marks the account as throttled. The first request
/// admitted after that reports `recovered: true` so the caller can clear any
/// rate-limit flag it raised, without touching flags raised elsewhere.
pub struct RequestLimiter {
    buckets: HashMap<String, Bucket>,
    throttled: HashSet<String>,
    capacity: u32,
    refill_rate: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, PartialEq)]
pub enum Admission {
    Allowed { recovered: bool },
    Throttled { retry_after: Duration },
}

impl RequestLimiter {
    /// - `capacity`: max burst size (requests)
    /// - `per_second`: sustained rate (requests/sec)
    ///
    /// A capacity of zero disables limiting.
    pub fn new(capacity: u32, per_second: f64) -> Self {
        Self {
            buckets: HashMap::new(),
            throttled: HashSet::new(),
            capacity,
            refill_rate: per_second,
        }
    }

    /// Change the limits in place. Throttled accounts stay marked so their
    /// next admission still reports recovery.
    pub fn reconfigure(&mut self, capacity: u32, per_second: f64) {
        self.capacity = capacity;
        self.refill_rate = per_second;
        let cap = capacity as f64;
        for bucket in self.buckets.values_mut() {
            bucket.tokens = bucket.tokens.min(cap);
        }
    }

    pub fn check(&mut self, account: &str) -> Admission {
        self.check_at(account, Instant::now())
    }

    fn check_at(&mut self, account: &str, now: Instant) -> Admission {
        if self.capacity == 0 {
            let recovered = self.throttled.remove(account);
            return Admission::Allowed { recovered };
        }

        let cap = self.capacity as f64;
        let rate = self.refill_rate;
        let bucket = self.buckets.entry(account.to_string()).or_insert(Bucket {
            tokens: cap,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(cap);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            let recovered = self.throttled.remove(account);
            Admission::Allowed { recovered }
        } else {
            let missing = 1.0 - bucket.tokens;
            let retry_after = if rate > 0.0 {
                Duration::from_secs_f64(missing / rate)
            } else {
                Duration::MAX
            };
            if self.throttled.insert(account.to_string()) {
                tracing::warn!(account = %account, "request rate exceeded, throttling");
            }
            Admission::Throttled { retry_after }
        }
    }

    /// Drop buckets idle for longer than `max_idle`.
    pub fn cleanup(&mut self, max_idle: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < max_idle);
    }

    pub fn is_throttled(&self, account: &str) -> bool {
        self.throttled.contains(account)
    }
}
