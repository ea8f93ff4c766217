//! Clock sources for age-based admission control
//!
//! TTL checks compare a record's timestamp against "now". Production code uses
//! a wall clock that never goes backward; tests substitute a manual clock so
//! boundary cases can be pinned to the exact millisecond.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock with a high-water mark so readings never go backward.
#[derive(Debug, Default)]
pub struct SystemClock {
    high_water_ms: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    /// If the wall clock has gone backward (e.g. NTP adjustment), the previous
    /// high-water mark is returned instead.
    fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        let prev = self.high_water_ms.fetch_max(wall, Ordering::AcqRel);
        wall.max(prev)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::Acquire)
    }
}

/// Returns true when a record stamped `timestamp_ms` is older than `ttl`.
///
/// A record whose age equals the TTL exactly is still admitted.
pub fn is_expired(now_ms: i64, timestamp_ms: i64, ttl: Duration) -> bool {
    now_ms.saturating_sub(timestamp_ms) > ttl.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_never_goes_backward() {
        let clock = SystemClock::new();
        let mut prev = 0i64;
        for _ in 0..100 {
            let ts = clock.now_millis();
            assert!(ts >= prev, "timestamps must not decrease");
            prev = ts;
        }
        // Should be a reasonable time (after 2020)
        assert!(prev > 1_577_836_800_000);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_millis(), 3_000);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn test_expiry_boundary() {
        let ttl = Duration::from_secs(60);
        let now = 1_000_000;
        assert!(!is_expired(now, now - 59_999, ttl), "younger than ttl is kept");
        assert!(!is_expired(now, now - 60_000, ttl), "age == ttl is kept");
        assert!(is_expired(now, now - 60_001, ttl), "older than ttl is dropped");
    }

    #[test]
    fn test_future_timestamps_are_not_expired() {
        assert!(!is_expired(1_000, 5_000, Duration::from_secs(1)));
    }
}
