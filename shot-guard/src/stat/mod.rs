//! Time-windowed statistics.
//!
//! Writes always land in the bucket covering "now"; reads aggregate over the
//! live buckets of a window. Counters are atomics, so recording never waits on
//! a reader or on another writer.

mod bucket_leap_array;
mod leap_array;
mod metric_bucket;
mod node;
mod sliding_window;

use std::fmt::Debug;

pub use bucket_leap_array::BucketLeapArray;
pub use leap_array::LeapArray;
pub use leap_array::WindowWrap;
pub use metric_bucket::MetricBucket;
pub use metric_bucket::MetricBucketGenerator;
pub use node::NodeRegistry;
pub use node::ResourceNode;
pub use node::TOTAL_INBOUND_RESOURCE_NAME;
pub use sliding_window::SlidingWindow;

/// Ceiling for response times, also the "no sample yet" value of min-RT.
pub const DEFAULT_STATISTIC_MAX_RT: u64 = 60_000;

/// Event kinds counted per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricEvent {
    Pass,
    Block,
    /// A passed call finished (success or business error).
    Complete,
    Error,
    /// Cumulative response time in milliseconds.
    Rt,
}

impl MetricEvent {
    pub const COUNT: usize = 5;

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Creates bucket payloads for a `LeapArray` and clears them for reuse.
pub trait BucketGenerator: Send + Sync {
    type Bucket: Send + Sync;

    fn new_empty_bucket(&self) -> Self::Bucket;

    /// Reset a bucket in place when its slot moves to a newer slice.
    fn reset_bucket(&self, bucket: &Self::Bucket);
}

/// Read side of a statistic, consulted by traffic shaping controllers.
pub trait ReadStat: Debug + Send + Sync {
    fn qps(&self, event: MetricEvent) -> f64;

    /// QPS of the interval immediately before the current one.
    fn previous_qps(&self, event: MetricEvent) -> f64;

    fn sum(&self, event: MetricEvent) -> u64;

    fn min_rt(&self) -> f64;

    fn avg_rt(&self) -> f64;
}

/// Write side of a statistic, fed by stat slots.
pub trait WriteStat: Debug + Send + Sync {
    fn add_count(&self, event: MetricEvent, count: u64);
}
