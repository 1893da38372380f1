use std::sync::Arc;

use super::BucketLeapArray;
use super::DEFAULT_STATISTIC_MAX_RT;
use super::MetricEvent;
use super::ReadStat;
use super::leap_array::calculate_window_start;
use crate::error::GuardError;
use crate::error::Result;

/// Rolling totals over the last `interval_ms`, read from a shared bucket array.
///
/// The view never writes. Its interval may be shorter than the array's, so a
/// node can keep, say, 10s of 500ms buckets and still answer "QPS over the last
/// second" and "QPS over the second before that".
#[derive(Debug)]
pub struct SlidingWindow {
    bucket_length_ms: u64,
    sample_count: u32,
    interval_ms: u64,
    real: Arc<BucketLeapArray>,
}

impl SlidingWindow {
    pub fn new(sample_count: u32, interval_ms: u32, real: Arc<BucketLeapArray>) -> Result<Self> {
        if sample_count == 0 || interval_ms == 0 || interval_ms % sample_count != 0 {
            return Err(GuardError::InvalidStatParams(format!(
                "window of {interval_ms}ms cannot be split into {sample_count} buckets"
            )));
        }
        let interval = interval_ms as u64;
        let bucket_length_ms = interval / sample_count as u64;
        if interval > real.interval_ms() || real.interval_ms() % interval != 0 {
            return Err(GuardError::InvalidStatParams(format!(
                "window of {interval_ms}ms does not fit the {}ms bucket array",
                real.interval_ms()
            )));
        }
        if bucket_length_ms % real.bucket_length_ms() != 0 {
            return Err(GuardError::InvalidStatParams(format!(
                "bucket length {bucket_length_ms}ms is not a multiple of {}ms",
                real.bucket_length_ms()
            )));
        }

        Ok(Self {
            bucket_length_ms,
            sample_count,
            interval_ms: interval,
            real,
        })
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn bucket_length_ms(&self) -> u64 {
        self.bucket_length_ms
    }

    /// Bucket starts `[start, end]` that make up the window ending at `now_ms`.
    fn bounds(&self, now_ms: u64) -> (u64, u64) {
        let real_len = self.real.bucket_length_ms();
        let end = calculate_window_start(now_ms, real_len);
        let start = (end + real_len).saturating_sub(self.interval_ms);
        (start, end)
    }

    fn fold_with_time<T, F>(&self, now_ms: u64, init: T, f: F) -> T
    where
        F: Fn(T, &super::MetricBucket) -> T,
    {
        let (start, end) = self.bounds(now_ms);
        self.real
            .values_conditional(now_ms, |ws| start <= ws && ws <= end)
            .into_iter()
            .fold(init, |acc, wrap| f(acc, wrap.value()))
    }

    pub fn count_with_time(&self, now_ms: u64, event: MetricEvent) -> u64 {
        self.fold_with_time(now_ms, 0, |acc, bucket| acc + bucket.get(event))
    }

    pub fn qps_with_time(&self, now_ms: u64, event: MetricEvent) -> f64 {
        self.count_with_time(now_ms, event) as f64 / (self.interval_ms as f64 / 1000.0)
    }

    /// Largest single-bucket count of `event` in the window.
    pub fn max_of_single_bucket(&self, event: MetricEvent) -> u64 {
        let now = self.real.time().now_ms();
        self.fold_with_time(now, 0, |acc, bucket| acc.max(bucket.get(event)))
    }

    fn now(&self) -> u64 {
        self.real.time().now_ms()
    }
}

impl ReadStat for SlidingWindow {
    fn qps(&self, event: MetricEvent) -> f64 {
        self.qps_with_time(self.now(), event)
    }

    fn previous_qps(&self, event: MetricEvent) -> f64 {
        let now = self.now();
        match now.checked_sub(self.interval_ms) {
            Some(previous) => self.qps_with_time(previous, event),
            None => 0.0,
        }
    }

    fn sum(&self, event: MetricEvent) -> u64 {
        self.count_with_time(self.now(), event)
    }

    fn min_rt(&self) -> f64 {
        self.fold_with_time(self.now(), DEFAULT_STATISTIC_MAX_RT, |acc, bucket| {
            acc.min(bucket.min_rt())
        }) as f64
    }

    fn avg_rt(&self) -> f64 {
        let now = self.now();
        let complete = self.count_with_time(now, MetricEvent::Complete);
        if complete == 0 {
            return 0.0;
        }
        self.count_with_time(now, MetricEvent::Rt) as f64 / complete as f64
    }
}
