use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use super::BucketGenerator;
use super::DEFAULT_STATISTIC_MAX_RT;
use super::MetricEvent;

/// Counters for one time slice. Every field is updated with atomic RMW only.
#[derive(Debug)]
pub struct MetricBucket {
    counters: [AtomicU64; MetricEvent::COUNT],
    min_rt: AtomicU64,
}

impl MetricBucket {
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
            min_rt: AtomicU64::new(DEFAULT_STATISTIC_MAX_RT),
        }
    }

    #[inline]
    pub fn add(&self, event: MetricEvent, count: u64) {
        self.counters[event.index()].fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, event: MetricEvent) -> u64 {
        self.counters[event.index()].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn update_min_rt(&self, rt: u64) {
        self.min_rt.fetch_min(rt, Ordering::Relaxed);
    }

    pub fn min_rt(&self) -> u64 {
        self.min_rt.load(Ordering::Relaxed)
    }

    /// Clear in place so the slot can be reused for a newer slice.
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        self.min_rt.store(DEFAULT_STATISTIC_MAX_RT, Ordering::Relaxed);
    }
}

impl Default for MetricBucket {
    fn default() -> Self {
        Self::new()
    }
}

/// Produces and recycles `MetricBucket`s for a `LeapArray`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricBucketGenerator;

impl BucketGenerator for MetricBucketGenerator {
    type Bucket = MetricBucket;

    fn new_empty_bucket(&self) -> MetricBucket {
        MetricBucket::new()
    }

    fn reset_bucket(&self, bucket: &MetricBucket) {
        bucket.reset();
    }
}
