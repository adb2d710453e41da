use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Sliding-window request counter keyed by client identity.
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    window: Duration,
    max_requests: usize,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl InMemoryRateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check_and_count(&self, key: &str) -> bool {
        self.check_and_count_at(key, Instant::now())
    }

    fn check_and_count_at(&self, key: &str, now: Instant) -> bool {
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut buckets = self.buckets.lock();
        // Idle clients would otherwise accumulate forever.
        buckets.retain(|_, bucket| bucket.back().map_or(false, |last| *last >= cutoff));
        let bucket = buckets.entry(key.to_string()).or_default();

        while let Some(front) = bucket.front().copied() {
            if front < cutoff {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= self.max_requests {
            return false;
        }

        bucket.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_after_the_limit_per_key() {
        let limiter = InMemoryRateLimiter::new(Duration::from_secs(60), 2);
        assert!(limiter.check_and_count("1.2.3.4"));
        assert!(limiter.check_and_count("1.2.3.4"));
        assert!(!limiter.check_and_count("1.2.3.4"));
        assert!(limiter.check_and_count("5.6.7.8"));
    }

    #[test]
    fn window_slides() {
        let limiter = InMemoryRateLimiter::new(Duration::from_secs(60), 1);
        let start = Instant::now();
        assert!(limiter.check_and_count_at("a", start));
        assert!(!limiter.check_and_count_at("a", start + Duration::from_secs(30)));
        assert!(limiter.check_and_count_at("a", start + Duration::from_secs(61)));
    }
}
