use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::error::RelayError;

/// Result of consuming one token from a window
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    /// Attempts left in the window before this one was consumed
    pub remaining: u64,
    /// Unix timestamp (seconds) at which the window resets
    pub reset: u64,
}

struct Window {
    count: u64,
    reset: u64,
}

/// Fixed-window counter store keyed by arbitrary string
///
/// The store is the seam where a cross-process backend would plug in for
/// horizontal scaling; the window arithmetic already matches that contract.
pub struct CounterStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore {
    pub fn new() -> Self {
        Self { windows: Mutex::new(HashMap::new()) }
    }

    /// Atomically consume one token for `key` in the current window
    ///
    /// `remaining == 0` means the quota was already exhausted and the
    /// caller must reject; expired windows restart transparently.
    pub fn get(&self, key: &str, max: u64, window: Duration) -> RateLimit {
        let now = now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        // Opportunistic cleanup of expired windows
        windows.retain(|_, w| w.reset > now);

        let entry = windows
            .entry(key.to_string())
            .or_insert_with(|| Window { count: 0, reset: now + window.as_secs().max(1) });
        let before = entry.count;
        if before < max {
            entry.count += 1;
        }
        RateLimit { remaining: max.saturating_sub(before), reset: entry.reset }
    }
}

/// Per-sender quota enforcement over a shared counter store
pub struct RateLimiter {
    store: CounterStore,
    max: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max: u64, window: Duration) -> Self {
        Self { store: CounterStore::new(), max, window }
    }

    /// Consume one attempt for `sender`, rejecting with 451 when over quota
    pub fn check(&self, sender: &str) -> Result<(), RelayError> {
        let limit = self.store.get(&sender.to_lowercase(), self.max, self.window);
        if limit.remaining == 0 {
            let retry_ms = (limit.reset * 1000).saturating_sub(now_millis());
            return Err(RelayError::RateLimited { retry: Duration::from_millis(retry_ms) });
        }
        Ok(())
    }
}

fn now() -> u64 {
    SystemTime::UNIX_EPOCH.elapsed().unwrap_or_default().as_secs()
}

fn now_millis() -> u64 {
    SystemTime::UNIX_EPOCH.elapsed().unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_third_attempt_rejected() {
        let limiter = RateLimiter::new(2, Duration::from_secs(3600));
        assert!(limiter.check("sender@example.com").is_ok());
        assert!(limiter.check("sender@example.com").is_ok());
        let err = limiter.check("sender@example.com").unwrap_err();
        assert_eq!(err.smtp_code(), 451);
        let msg = err.to_string();
        assert!(msg.contains("retry in"), "{}", msg);
        assert!(msg.contains("minute") || msg.contains("hour"), "{}", msg);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(3600));
        assert!(limiter.check("a@example.com").is_ok());
        assert!(limiter.check("b@example.com").is_ok());
        assert!(limiter.check("a@example.com").is_err());
    }

    #[test]
    fn test_key_is_case_insensitive() {
        let limiter = RateLimiter::new(1, Duration::from_secs(3600));
        assert!(limiter.check("Sender@Example.com").is_ok());
        assert!(limiter.check("sender@example.com").is_err());
    }

    #[test]
    fn test_remaining_counts_down() {
        let store = CounterStore::new();
        let window = Duration::from_secs(60);
        assert_eq!(store.get("k", 3, window).remaining, 3);
        assert_eq!(store.get("k", 3, window).remaining, 2);
        assert_eq!(store.get("k", 3, window).remaining, 1);
        assert_eq!(store.get("k", 3, window).remaining, 0);
        assert_eq!(store.get("k", 3, window).remaining, 0);
    }

    #[test]
    fn test_reset_is_window_end() {
        let store = CounterStore::new();
        let limit = store.get("k", 1, Duration::from_secs(3600));
        let expected = now() + 3600;
        assert!(limit.reset >= expected - 1 && limit.reset <= expected + 1);
    }
}
