use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;

use super::CounterStore;
use crate::clock::TimeSource;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: i64,
    expires_at_ms: Option<u64>,
}

impl Counter {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// Minimum time between two sweeps of expired keys triggered by writes.
const SWEEP_INTERVAL_MS: u64 = 1_000;

/// In-process `CounterStore`, for tests and single-host deployments.
///
/// Expired keys are evicted when read, and by a sweep that writes run at most
/// once per [`SWEEP_INTERVAL_MS`], so per-bucket keys do not pile up.
#[derive(Debug)]
pub struct MemoryCounterStore {
    counters: DashMap<String, Counter>,
    last_sweep_ms: AtomicU64,
    time: TimeSource,
}

impl MemoryCounterStore {
    pub fn new(time: TimeSource) -> Self {
        Self {
            counters: DashMap::new(),
            last_sweep_ms: AtomicU64::new(time.now_ms()),
            time,
        }
    }

    /// Current value of `key`, if it exists and has not expired.
    pub fn get(&self, key: &str) -> Option<i64> {
        let now = self.time.now_ms();
        let live = self
            .counters
            .get(key)
            .filter(|c| !c.is_expired(now))
            .map(|c| c.value);
        if live.is_none() {
            self.counters.remove_if(key, |_, c| c.is_expired(now));
        }
        live
    }

    /// Drop every expired key.
    pub fn purge_expired(&self) {
        self.purge_expired_at(self.time.now_ms());
    }

    fn purge_expired_at(&self, now_ms: u64) {
        self.counters.retain(|_, c| !c.is_expired(now_ms));
    }

    // Must not be called while holding a reference into `counters`.
    fn maybe_sweep(&self, now_ms: u64) {
        let last = self.last_sweep_ms.load(Ordering::Acquire);
        if now_ms < last.saturating_add(SWEEP_INTERVAL_MS) {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.purge_expired_at(now_ms);
        }
    }

    /// Number of keys held, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl CounterStore for MemoryCounterStore {
    fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let now = self.time.now_ms();
        self.maybe_sweep(now);
        let mut counter = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at_ms: None,
        });
        if counter.is_expired(now) {
            *counter = Counter {
                value: 0,
                expires_at_ms: None,
            };
        }
        counter.value += delta;
        Ok(counter.value)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = self.time.now_ms();
        if let Some(mut counter) = self.counters.get_mut(key) {
            counter.expires_at_ms = Some(now + ttl.as_millis() as u64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_le;
    use quanta::Clock;

    use super::*;

    #[test]
    fn keys_expire_after_their_ttl() {
        let (clock, mock) = Clock::mock();
        let store = MemoryCounterStore::new(TimeSource::with_clock(clock, 0));

        assert_eq!(store.incr_by("orders:0", 5).unwrap(), 5);
        store.expire("orders:0", Duration::from_millis(1_000)).unwrap();
        assert_eq!(store.incr_by("orders:0", 5).unwrap(), 10);

        mock.increment(Duration::from_millis(999));
        assert_eq!(store.get("orders:0"), Some(10));

        mock.increment(Duration::from_millis(1));
        assert_eq!(store.get("orders:0"), None);
        // Reading an expired key evicts it
        assert!(store.is_empty());
    }

    #[test]
    fn unread_buckets_are_swept_by_later_writes() {
        let (clock, mock) = Clock::mock();
        let store = MemoryCounterStore::new(TimeSource::with_clock(clock, 0));

        for bucket in 0..1_000 {
            let key = format!("orders:{bucket}");
            store.incr_by(&key, 1).unwrap();
            store.expire(&key, Duration::from_millis(1_000)).unwrap();
            mock.increment(Duration::from_millis(1_000));
        }
        assert_le!(store.len(), 2);

        store.purge_expired();
        assert!(store.is_empty());
    }

    #[test]
    fn expired_key_restarts_from_zero() {
        let (clock, mock) = Clock::mock();
        let store = MemoryCounterStore::new(TimeSource::with_clock(clock, 0));

        store.incr_by("k", 7).unwrap();
        store.expire("k", Duration::from_millis(10)).unwrap();
        mock.increment(Duration::from_millis(10));

        assert_eq!(store.incr_by("k", 2).unwrap(), 2);
        // Expiring a missing key is not an error
        store.expire("missing", Duration::from_millis(10)).unwrap();
        assert_eq!(store.get("missing"), None);
    }
}
