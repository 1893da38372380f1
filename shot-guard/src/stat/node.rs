use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use parking_lot::RwLock;
use tracing::error;
use tracing::warn;

use super::BucketLeapArray;
use super::MetricEvent;
use super::ReadStat;
use super::SlidingWindow;
use super::WriteStat;
use crate::base::ResourceType;
use crate::clock::TimeSource;
use crate::config::GuardConfig;
use crate::config::StatConfig;
use crate::error::Result;

/// Name of the node aggregating all inbound traffic.
pub const TOTAL_INBOUND_RESOURCE_NAME: &str = "__total_inbound_traffic__";

/// Statistics of one resource: a bucket array, a realtime view over it, and
/// the number of calls currently in flight.
#[derive(Debug)]
pub struct ResourceNode {
    name: String,
    resource_type: ResourceType,
    arr: Arc<BucketLeapArray>,
    metric: Arc<SlidingWindow>,
    concurrency: AtomicI64,
}

impl ResourceNode {
    pub fn new(
        name: impl Into<String>,
        resource_type: ResourceType,
        stat: &StatConfig,
        time: TimeSource,
    ) -> Result<Self> {
        let arr = Arc::new(BucketLeapArray::new(
            stat.sample_count_total,
            stat.interval_ms_total,
            time,
        )?);
        let metric = Arc::new(SlidingWindow::new(
            stat.metric_sample_count,
            stat.metric_interval_ms,
            arr.clone(),
        )?);
        Ok(Self {
            name: name.into(),
            resource_type,
            arr,
            metric,
            concurrency: AtomicI64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn add_count(&self, event: MetricEvent, count: u64) {
        self.arr.add_count(event, count);
    }

    pub fn increase_concurrency(&self) {
        self.concurrency.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrease_concurrency(&self) {
        self.concurrency.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn current_concurrency(&self) -> i64 {
        self.concurrency.load(Ordering::Acquire)
    }

    /// Account for a passed call that has finished.
    pub fn record_completion(&self, rt_ms: u64, batch_count: u64, failed: bool) {
        self.arr.add_count(MetricEvent::Rt, rt_ms);
        self.arr.update_min_rt(rt_ms);
        self.arr.add_count(MetricEvent::Complete, batch_count);
        if failed {
            self.arr.add_count(MetricEvent::Error, batch_count);
        }
    }

    /// The realtime window.
    pub fn metric(&self) -> &Arc<SlidingWindow> {
        &self.metric
    }

    pub fn bucket_array(&self) -> &Arc<BucketLeapArray> {
        &self.arr
    }

    /// A read-only view with a different interval over this node's buckets.
    pub fn generate_read_stat(&self, sample_count: u32, interval_ms: u32) -> Result<Arc<SlidingWindow>> {
        Ok(Arc::new(SlidingWindow::new(
            sample_count,
            interval_ms,
            self.arr.clone(),
        )?))
    }

    pub fn pass_qps(&self) -> f64 {
        self.metric.qps(MetricEvent::Pass)
    }

    pub fn block_qps(&self) -> f64 {
        self.metric.qps(MetricEvent::Block)
    }

    pub fn complete_qps(&self) -> f64 {
        self.metric.qps(MetricEvent::Complete)
    }

    pub fn error_qps(&self) -> f64 {
        self.metric.qps(MetricEvent::Error)
    }

    /// Pass plus block.
    pub fn total_qps(&self) -> f64 {
        self.pass_qps() + self.block_qps()
    }

    pub fn avg_rt(&self) -> f64 {
        self.metric.avg_rt()
    }

    pub fn min_rt(&self) -> f64 {
        self.metric.min_rt()
    }
}

impl ReadStat for ResourceNode {
    fn qps(&self, event: MetricEvent) -> f64 {
        self.metric.qps(event)
    }

    fn previous_qps(&self, event: MetricEvent) -> f64 {
        self.metric.previous_qps(event)
    }

    fn sum(&self, event: MetricEvent) -> u64 {
        self.metric.sum(event)
    }

    fn min_rt(&self) -> f64 {
        self.metric.min_rt()
    }

    fn avg_rt(&self) -> f64 {
        self.metric.avg_rt()
    }
}

impl WriteStat for ResourceNode {
    fn add_count(&self, event: MetricEvent, count: u64) {
        ResourceNode::add_count(self, event, count);
    }
}

/// Owns every `ResourceNode`. Constructed once and shared by reference with
/// the slots and rule managers that need it.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<ResourceNode>>>,
    inbound: Arc<ResourceNode>,
    stat: StatConfig,
    max_resource_amount: usize,
    time: TimeSource,
}

impl NodeRegistry {
    pub fn new(config: &GuardConfig, time: TimeSource) -> Result<Self> {
        config.validate()?;
        let inbound = Arc::new(ResourceNode::new(
            TOTAL_INBOUND_RESOURCE_NAME,
            ResourceType::Common,
            &config.stat,
            time.clone(),
        )?);
        Ok(Self {
            nodes: RwLock::new(HashMap::new()),
            inbound,
            stat: config.stat.clone(),
            max_resource_amount: config.max_resource_amount,
            time,
        })
    }

    pub fn get(&self, resource: &str) -> Option<Arc<ResourceNode>> {
        self.nodes.read().get(resource).cloned()
    }

    /// Fetch the node of `resource`, creating it on first use.
    ///
    /// Returns `None` once `max_resource_amount` nodes exist; such calls are
    /// still admitted but not recorded.
    pub fn get_or_create(&self, resource: &str, resource_type: ResourceType) -> Option<Arc<ResourceNode>> {
        if let Some(node) = self.get(resource) {
            return Some(node);
        }

        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get(resource) {
            return Some(node.clone());
        }
        if nodes.len() >= self.max_resource_amount {
            warn!(
                resource,
                max = self.max_resource_amount,
                "resource amount exceeds the limit, statistics will not be recorded"
            );
            return None;
        }
        match ResourceNode::new(resource, resource_type, &self.stat, self.time.clone()) {
            Ok(node) => {
                let node = Arc::new(node);
                nodes.insert(resource.to_string(), node.clone());
                Some(node)
            }
            Err(err) => {
                error!(resource, error = %err, "failed to create resource node");
                None
            }
        }
    }

    pub fn inbound_node(&self) -> &Arc<ResourceNode> {
        &self.inbound
    }

    pub fn resource_names(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stat_config(&self) -> &StatConfig {
        &self.stat
    }

    pub fn time(&self) -> &TimeSource {
        &self.time
    }
}
