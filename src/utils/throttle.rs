//! Log throttling for per-packet warnings
//!
//! Drop paths (full decode queues, slow MJPEG clients, broken FU-A runs) can
//! fire hundreds of times per second. The throttler lets the first warning
//! through and then reports how many were suppressed in the interval.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    last: Instant,
    suppressed: u64,
}

/// Limits how often the same message key is logged
pub struct LogThrottler {
    entries: Mutex<HashMap<&'static str, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `Some(suppressed)` when the message should be logged, where
    /// `suppressed` counts the calls swallowed since the last logged one.
    pub fn should_log(&self, key: &'static str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key,
                    Entry {
                        last: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget a key so the next occurrence is logged immediately
    pub fn clear(&self, key: &'static str) {
        self.entries.lock().remove(key);
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`; appends the suppressed count when non-zero
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.should_log($key) {
            if suppressed > 0 {
                tracing::warn!(suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_call_logs_then_throttles() {
        let throttler = LogThrottler::new(Duration::from_millis(100));
        assert_eq!(throttler.should_log("drop"), Some(0));
        assert_eq!(throttler.should_log("drop"), None);
        assert_eq!(throttler.should_log("drop"), None);

        thread::sleep(Duration::from_millis(150));
        assert_eq!(throttler.should_log("drop"), Some(2));
    }

    #[test]
    fn keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("a").is_some());
        assert!(throttler.should_log("b").is_some());
        assert!(throttler.should_log("a").is_none());
    }

    #[test]
    fn clear_resets_key() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("a").is_some());
        throttler.clear("a");
        assert_eq!(throttler.should_log("a"), Some(0));
    }
}
