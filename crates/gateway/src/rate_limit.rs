use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Fixed-window request counter keyed by caller. This is abuse protection in
/// front of the ledger, not metering; the ledger remains the authority on
/// what a caller may consume.
#[derive(Clone)]
pub(crate) struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, Window>>>,
    window: Duration,
    max_keys: usize,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

impl RateLimiter {
    pub(crate) fn new(window: Duration, max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            max_keys,
        }
    }

    pub(crate) fn allow(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if inner.len() > self.max_keys {
            let window = self.window;
            inner.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = inner.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            return false;
        }
        entry.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn limiter_rejects_once_the_window_is_full() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 16);
        assert!(limiter.allow("caller", 2));
        assert!(limiter.allow("caller", 2));
        assert!(!limiter.allow("caller", 2));
    }

    #[test]
    fn limiter_resets_when_the_window_rolls_over() {
        let limiter = RateLimiter::new(Duration::from_millis(5), 16);
        assert!(limiter.allow("caller", 1));
        assert!(!limiter.allow("caller", 1));
        thread::sleep(Duration::from_millis(10));
        assert!(limiter.allow("caller", 1));
    }

    #[test]
    fn zero_limit_disables_the_limiter() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 16);
        for _ in 0..100 {
            assert!(limiter.allow("caller", 0));
        }
    }

    #[test]
    fn keys_are_limited_independently() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 16);
        assert!(limiter.allow("a", 1));
        assert!(!limiter.allow("a", 1));
        assert!(limiter.allow("b", 1));
    }
}
