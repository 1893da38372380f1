use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use quanta::Clock;
use quanta::Instant;

/// Epoch-aligned time built on a monotonic `quanta` clock.
///
/// Window arithmetic needs wall-clock milliseconds (bucket starts are
/// multiples of the bucket length), while the hot path wants a cheap,
/// monotonic read. We capture the epoch once and add the monotonic delta.
#[derive(Debug, Clone)]
pub struct TimeSource {
    clock: Clock,
    anchor: Instant,
    base_ms: u64,
}

impl TimeSource {
    pub fn new() -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::with_clock(Clock::new(), base_ms)
    }

    /// Use a specific clock, typically `Clock::mock()` in tests, starting at `base_ms`.
    pub fn with_clock(clock: Clock, base_ms: u64) -> Self {
        let anchor = clock.now();
        Self {
            clock,
            anchor,
            base_ms,
        }
    }

    #[inline]
    fn elapsed(&self) -> Duration {
        self.clock.now().duration_since(self.anchor)
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.base_ms + self.elapsed().as_millis() as u64
    }

    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.base_ms * 1_000_000 + self.elapsed().as_nanos() as u64
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}
