use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Time source used by the in-memory subsystems.
///
/// Components that keep relative deadlines (orphan expiry) read the
/// monotonic clock, while components that compare against peer-provided
/// timestamps (spork signing times) read the network-adjusted wall clock.
/// Injecting the clock keeps every time-dependent code path deterministic
/// under test.
pub trait NodeClock {
    /// A monotonic instant, used for relative deadlines.
    fn now(&self) -> Instant;

    /// The network-adjusted wall clock, in unix seconds.
    ///
    /// May jump when the peer layer recomputes the median peer offset.
    fn adjusted_time(&self) -> i64;
}

/// The real clock.
///
/// `adjusted_time` returns plain wall time here; the node layer is
/// responsible for wrapping this with a median-peer-offset correction if it
/// tracks one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl NodeClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn adjusted_time(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time is after the unix epoch")
            .as_secs() as i64
    }
}

/// A manually advanced clock for tests and simulations.
///
/// Clones share the same state, so a test can keep one handle and advance
/// time while the component under test holds another.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    offset_ms: Arc<AtomicU64>,
    adjusted: Arc<AtomicI64>,
}

impl MockClock {
    /// Creates a clock frozen at `adjusted_time` unix seconds.
    pub fn new(adjusted_time: i64) -> Self {
        Self {
            start: Instant::now(),
            offset_ms: Arc::new(AtomicU64::new(0)),
            adjusted: Arc::new(AtomicI64::new(adjusted_time)),
        }
    }

    /// Moves both the monotonic and the adjusted clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.offset_ms
            .fetch_add(delta.as_millis() as u64, Ordering::Relaxed);
        self.adjusted
            .fetch_add(delta.as_secs() as i64, Ordering::Relaxed);
    }

    /// Sets the adjusted wall clock, leaving the monotonic clock untouched.
    pub fn set_adjusted_time(&self, adjusted_time: i64) {
        self.adjusted.store(adjusted_time, Ordering::Relaxed);
    }
}

impl NodeClock for MockClock {
    fn now(&self) -> Instant {
        self.start + Duration::from_millis(self.offset_ms.load(Ordering::Relaxed))
    }

    fn adjusted_time(&self) -> i64 {
        self.adjusted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::new(1_000);
        let handle = clock.clone();
        let t0 = clock.now();

        handle.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - t0, Duration::from_secs(90));
        assert_eq!(clock.adjusted_time(), 1_090);

        handle.set_adjusted_time(5_000);
        assert_eq!(clock.adjusted_time(), 5_000);
        // monotonic clock is unaffected by adjusted-time jumps
        assert_eq!(clock.now() - t0, Duration::from_secs(90));
    }

    #[test]
    fn test_system_clock_sanity() {
        let clock = SystemClock;
        // The unix timestamp is on the right side of 2020.
        assert!(clock.adjusted_time() > 1_577_836_800);
        assert!(clock.now() <= Instant::now());
    }
}
