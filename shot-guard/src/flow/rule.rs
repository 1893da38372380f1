use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::error::GuardError;
use crate::error::Result;

/// Longest statistic interval a rule may ask for.
pub const MAX_STAT_INTERVAL_MS: u32 = 10 * 60 * 1000;

/// How the allowed threshold is computed for each check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenCalculateStrategy {
    /// The rule's threshold, as is.
    #[default]
    Direct,
    /// Ramp up from `threshold / warm_up_cold_factor` over `warm_up_period_sec`.
    WarmUp,
}

/// What happens to a call over the threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlBehavior {
    #[default]
    Reject,
    /// Space calls evenly, queueing them for up to `max_queueing_time_ms`.
    Throttling,
}

/// The statistic a threshold is compared against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    #[default]
    Qps,
    Concurrency,
}

/// Whose statistics a rule reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationStrategy {
    #[default]
    CurrentResource,
    /// Read the statistics of `ref_resource` instead.
    AssociatedResource,
}

/// A flow control rule for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowRule {
    /// Optional identifier, for logs only.
    pub id: String,
    pub resource: String,
    pub token_calculate_strategy: TokenCalculateStrategy,
    pub control_behavior: ControlBehavior,
    pub metric_type: MetricType,
    /// Tokens per statistic interval (or concurrent calls for `MetricType::Concurrency`).
    pub threshold: f64,
    pub relation_strategy: RelationStrategy,
    pub ref_resource: String,
    pub max_queueing_time_ms: u32,
    pub warm_up_period_sec: u32,
    pub warm_up_cold_factor: u32,
    /// Interval the threshold applies to; 0 means the resource's realtime window.
    pub stat_interval_ms: u32,
    /// Enforce the threshold across processes through the token service.
    pub cluster_mode: bool,
    /// Tokens fetched from the token service per remote call.
    pub token_batch_size: u32,
}

impl Default for FlowRule {
    fn default() -> Self {
        Self {
            id: String::new(),
            resource: String::new(),
            token_calculate_strategy: TokenCalculateStrategy::Direct,
            control_behavior: ControlBehavior::Reject,
            metric_type: MetricType::Qps,
            threshold: 0.0,
            relation_strategy: RelationStrategy::CurrentResource,
            ref_resource: String::new(),
            max_queueing_time_ms: 0,
            warm_up_period_sec: 0,
            warm_up_cold_factor: 3,
            stat_interval_ms: 0,
            cluster_mode: false,
            token_batch_size: 1,
        }
    }
}

impl FlowRule {
    /// The resource whose statistics this rule reads.
    pub fn stat_resource(&self) -> &str {
        match self.relation_strategy {
            RelationStrategy::CurrentResource => &self.resource,
            RelationStrategy::AssociatedResource => &self.ref_resource,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(GuardError::InvalidRule {
                resource: self.resource.clone(),
                reason: reason.to_string(),
            })
        };

        if self.resource.is_empty() {
            return invalid("empty resource name");
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return invalid("threshold must be a finite, non-negative number");
        }
        if self.stat_interval_ms > MAX_STAT_INTERVAL_MS {
            return invalid("stat_interval_ms must not exceed 10 minutes");
        }
        if self.token_calculate_strategy == TokenCalculateStrategy::WarmUp {
            if self.warm_up_period_sec == 0 {
                return invalid("warm_up_period_sec must be positive");
            }
            if self.warm_up_cold_factor <= 1 {
                return invalid("warm_up_cold_factor must be greater than 1");
            }
        }
        if self.relation_strategy == RelationStrategy::AssociatedResource && self.ref_resource.is_empty() {
            return invalid("associated relation needs a ref_resource");
        }
        if self.metric_type == MetricType::Concurrency
            && (self.token_calculate_strategy != TokenCalculateStrategy::Direct
                || self.control_behavior != ControlBehavior::Reject)
        {
            return invalid("concurrency rules only support Direct with Reject");
        }
        if self.cluster_mode {
            if self.metric_type != MetricType::Qps {
                return invalid("cluster rules must be QPS graded");
            }
            if self.stat_interval_ms == 0 {
                return invalid("cluster rules need an explicit stat_interval_ms");
            }
        }
        Ok(())
    }
}

pub fn is_valid_rule(rule: &FlowRule) -> bool {
    rule.validate().is_ok()
}

impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FlowRule{{resource={}, threshold={}, {:?}/{:?}/{:?}",
            self.resource,
            self.threshold,
            self.token_calculate_strategy,
            self.control_behavior,
            self.metric_type
        )?;
        if !self.id.is_empty() {
            write!(f, ", id={}", self.id)?;
        }
        if self.cluster_mode {
            write!(f, ", cluster(batch={})", self.token_batch_size)?;
        }
        f.write_str("}")
    }
}
