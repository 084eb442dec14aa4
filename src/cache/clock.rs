//! Injectable time source so cache TTL behavior is testable without real
//! wall-clock sleeps.

use std::time::{SystemTime, UNIX_EPOCH};

/// A source of unix-second timestamps.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u64;
}

/// The real system clock. Default for all cache backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A clock whose value is set explicitly by the test. Not reachable from
/// non-test code.
#[cfg(test)]
#[derive(Debug)]
pub struct TestClock(pub std::sync::atomic::AtomicU64);

#[cfg(test)]
impl Clock for TestClock {
    fn now_unix(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
impl TestClock {
    pub fn new(start: u64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(start))
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, std::sync::atomic::Ordering::Relaxed);
    }
}
