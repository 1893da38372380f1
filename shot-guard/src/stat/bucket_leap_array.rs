use tracing::error;

use super::LeapArray;
use super::MetricBucket;
use super::MetricBucketGenerator;
use super::MetricEvent;
use super::WindowWrap;
use super::WriteStat;
use crate::clock::TimeSource;
use crate::error::Result;

/// A `LeapArray` of `MetricBucket`s bound to a time source.
#[derive(Debug)]
pub struct BucketLeapArray {
    data: LeapArray<MetricBucketGenerator>,
    time: TimeSource,
}

impl BucketLeapArray {
    pub fn new(sample_count: u32, interval_ms: u32, time: TimeSource) -> Result<Self> {
        Ok(Self {
            data: LeapArray::new(sample_count, interval_ms, MetricBucketGenerator)?,
            time,
        })
    }

    pub fn sample_count(&self) -> u32 {
        self.data.sample_count()
    }

    pub fn interval_ms(&self) -> u64 {
        self.data.interval_ms()
    }

    pub fn bucket_length_ms(&self) -> u64 {
        self.data.window_length_ms()
    }

    pub fn time(&self) -> &TimeSource {
        &self.time
    }

    pub fn current_bucket_with_time(&self, now_ms: u64) -> Result<&MetricBucket> {
        self.data
            .current_window_with_time(now_ms)
            .map(WindowWrap::value)
    }

    /// Record `count` events in the current bucket.
    ///
    /// Statistics are best effort: a clock-ordering failure is logged and the
    /// sample dropped.
    pub fn add_count(&self, event: MetricEvent, count: u64) {
        let now = self.time.now_ms();
        if let Err(err) = self.add_count_with_time(now, event, count) {
            error!(?event, count, error = %err, "dropping statistic sample");
        }
    }

    pub fn add_count_with_time(&self, now_ms: u64, event: MetricEvent, count: u64) -> Result<()> {
        self.current_bucket_with_time(now_ms)?.add(event, count);
        Ok(())
    }

    /// Sum of `event` over the whole interval.
    pub fn count(&self, event: MetricEvent) -> u64 {
        self.count_with_time(self.time.now_ms(), event)
    }

    pub fn count_with_time(&self, now_ms: u64, event: MetricEvent) -> u64 {
        self.data
            .values_with_time(now_ms)
            .iter()
            .map(|wrap| wrap.value().get(event))
            .sum()
    }

    pub fn update_min_rt(&self, rt: u64) {
        let now = self.time.now_ms();
        match self.current_bucket_with_time(now) {
            Ok(bucket) => bucket.update_min_rt(rt),
            Err(err) => error!(rt, error = %err, "dropping min-rt sample"),
        }
    }

    pub fn values_conditional<P>(&self, now_ms: u64, predicate: P) -> Vec<&WindowWrap<MetricBucket>>
    where
        P: Fn(u64) -> bool,
    {
        self.data.values_conditional(now_ms, predicate)
    }
}

impl WriteStat for BucketLeapArray {
    fn add_count(&self, event: MetricEvent, count: u64) {
        BucketLeapArray::add_count(self, event, count);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use quanta::Clock;

    use super::*;

    fn mocked(sample_count: u32, interval_ms: u32) -> (BucketLeapArray, std::sync::Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let time = TimeSource::with_clock(clock, 0);
        (
            BucketLeapArray::new(sample_count, interval_ms, time).unwrap(),
            mock,
        )
    }

    #[test]
    fn counts_sum_within_one_window() {
        let (arr, mock) = mocked(5, 1_000);
        mock.increment(Duration::from_millis(410));

        for n in [1, 4, 9, 16] {
            arr.add_count(MetricEvent::Pass, n);
        }
        arr.add_count(MetricEvent::Block, 2);

        assert_eq!(arr.count(MetricEvent::Pass), 30);
        assert_eq!(arr.count(MetricEvent::Block), 2);
        assert_eq!(arr.count(MetricEvent::Error), 0);
    }

    #[test]
    fn counts_span_buckets_of_the_interval() {
        let (arr, mock) = mocked(5, 1_000);
        for _ in 0..5 {
            arr.add_count(MetricEvent::Pass, 1);
            mock.increment(Duration::from_millis(200));
        }
        // now = 1000, the bucket starting at 0 has just aged out
        assert_eq!(arr.count(MetricEvent::Pass), 4);
    }

    #[test]
    fn counts_age_out_after_one_interval() {
        let (arr, mock) = mocked(5, 1_000);
        arr.add_count(MetricEvent::Pass, 10);
        arr.add_count(MetricEvent::Complete, 3);
        assert_eq!(arr.count(MetricEvent::Pass), 10);

        mock.increment(Duration::from_millis(1_000));
        assert_eq!(arr.count(MetricEvent::Pass), 0);
        assert_eq!(arr.count(MetricEvent::Complete), 0);

        // Writing again rotates the slot without leaking old counts
        arr.add_count(MetricEvent::Pass, 1);
        assert_eq!(arr.count(MetricEvent::Pass), 1);
    }

    #[test]
    fn min_rt_tracks_current_bucket() {
        let (arr, _mock) = mocked(2, 1_000);
        arr.update_min_rt(25);
        arr.update_min_rt(12);
        arr.update_min_rt(40);

        let bucket = arr.current_bucket_with_time(0).unwrap();
        assert_eq!(bucket.min_rt(), 12);
    }

    #[test]
    fn stale_write_is_rejected() {
        let (arr, _mock) = mocked(5, 1_000);
        arr.add_count_with_time(1_200, MetricEvent::Pass, 1).unwrap();
        assert!(arr.add_count_with_time(200, MetricEvent::Pass, 1).is_err());
        assert_eq!(arr.count_with_time(1_200, MetricEvent::Pass), 1);
    }
}
