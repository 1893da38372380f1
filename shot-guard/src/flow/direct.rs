use std::sync::Arc;

use super::FlowRule;
use super::MetricType;
use super::StandaloneStat;
use crate::base::BlockError;
use crate::base::TokenResult;
use crate::stat::MetricEvent;

/// Uses the rule's threshold unchanged.
#[derive(Debug)]
pub struct DirectCalculator {
    threshold: f64,
}

impl DirectCalculator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    #[inline]
    pub fn calculate_allowed_tokens(&self) -> f64 {
        self.threshold
    }
}

/// Blocks as soon as the current value plus the batch would go over the threshold.
#[derive(Debug)]
pub struct RejectChecker {
    metric_type: MetricType,
}

impl RejectChecker {
    pub fn new(metric_type: MetricType) -> Self {
        Self { metric_type }
    }

    pub fn do_check(
        &self,
        rule: &Arc<FlowRule>,
        stat: &StandaloneStat,
        batch_count: u32,
        threshold: f64,
    ) -> TokenResult {
        let current = match self.metric_type {
            MetricType::Qps => stat.read_only().sum(MetricEvent::Pass) as f64,
            MetricType::Concurrency => stat
                .node()
                .map(|node| node.current_concurrency().max(0) as f64)
                .unwrap_or_default(),
        };
        if current + batch_count as f64 <= threshold {
            return TokenResult::Pass;
        }
        TokenResult::Blocked(BlockError::flow(
            rule.clone(),
            format!("{:?} {current} reached threshold {threshold}", self.metric_type),
            current,
        ))
    }
}
