//! Log throttling utility
//!
//! A decode loop that loses its network hits the same error on every packet.
//! The throttler lets one line through per interval and remembers how many
//! repeats it swallowed, so the next emitted line can report them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
struct KeyState {
    last_logged: Instant,
    suppressed: u64,
}

/// Per-key log rate limiter with suppressed-repeat accounting
///
/// # Example
///
/// ```rust
/// use camwall::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert_eq!(throttler.check("read_error"), Some(0));
/// assert_eq!(throttler.check("read_error"), None);
/// ```
pub struct LogThrottler {
    keys: Mutex<HashMap<String, KeyState>>,
    interval: Duration,
}

impl LogThrottler {
    /// Create a new log throttler with the specified interval
    pub fn new(interval: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Create a new log throttler with interval specified in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Decide whether a line for `key` should be emitted now.
    ///
    /// Returns `Some(n)` when it should, where `n` is how many calls were
    /// swallowed since the previous emitted line. Returns `None` when throttled.
    pub fn check(&self, key: &str) -> Option<u64> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Option<u64> {
        let mut keys = self.keys.lock();
        match keys.get_mut(key) {
            Some(state) if now.duration_since(state.last_logged) < self.interval => {
                state.suppressed += 1;
                None
            }
            Some(state) => {
                let suppressed = state.suppressed;
                state.last_logged = now;
                state.suppressed = 0;
                Some(suppressed)
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Whether a line for `key` should be emitted now
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Forget a key, typically once the condition it tracked has recovered.
    ///
    /// Returns the number of repeats that were swallowed and never reported.
    pub fn clear(&self, key: &str) -> u64 {
        self.keys
            .lock()
            .remove(key)
            .map(|state| state.suppressed)
            .unwrap_or(0)
    }

    /// Forget every key
    pub fn clear_all(&self) {
        self.keys.lock().clear();
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    /// Whether no key is tracked
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled warning, appending the suppressed-repeat count when non-zero
///
/// ```rust
/// use camwall::utils::LogThrottler;
/// use camwall::warn_throttled;
///
/// let throttler = LogThrottler::default();
/// warn_throttled!(throttler, "read", "read failed: {}", "timeout");
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!("{} (suppressed {} repeats)", format_args!($($arg)*), suppressed);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

/// Throttled debug line, appending the suppressed-repeat count when non-zero
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::debug!("{} (suppressed {} repeats)", format_args!($($arg)*), suppressed);
            } else {
                tracing::debug!($($arg)*);
            }
        }
    };
}
