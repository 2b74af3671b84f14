//! Capped exponential backoff as an iterator of delays.
//!
//! Retry loops (store busy-retries, webhook delivery) pull delays from this
//! iterator instead of computing them inline, so the progression is a single
//! testable value: base, base*2, base*4, ... capped at `cap`.

use std::time::Duration;

/// Infinite iterator of exponentially growing delays, capped at `cap`.
///
/// Callers bound the number of retries with `.take(n)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Backoff {
            current: base.min(cap),
            cap,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(2)
            .unwrap_or(self.cap)
            .min(self.cap);
        Some(delay)
    }
}
