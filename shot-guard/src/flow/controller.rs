use std::sync::Arc;

use tracing::warn;

use super::ControlBehavior;
use super::DirectCalculator;
use super::FlowRule;
use super::RejectChecker;
use super::ThrottlingChecker;
use super::TokenCalculateStrategy;
use super::WarmUpCalculator;
use crate::base::ResourceType;
use crate::base::TokenResult;
use crate::cluster::ClusterChecker;
use crate::cluster::TokenService;
use crate::error::Result;
use crate::stat::BucketLeapArray;
use crate::stat::NodeRegistry;
use crate::stat::ReadStat;
use crate::stat::ResourceNode;
use crate::stat::SlidingWindow;
use crate::stat::WriteStat;

/// The statistics a controller reads, and writes when it owns them.
#[derive(Debug, Clone)]
pub struct StandaloneStat {
    reuse_global: bool,
    interval_ms: u32,
    read_only: Arc<dyn ReadStat>,
    write_only: Option<Arc<dyn WriteStat>>,
    node: Option<Arc<ResourceNode>>,
}

impl StandaloneStat {
    /// Pick the cheapest statistic that answers over the rule's interval:
    /// the node's realtime window, a view over the node's buckets, or a
    /// private bucket array fed by `StandaloneStatSlot`.
    pub fn generate(rule: &FlowRule, registry: &NodeRegistry) -> Result<Self> {
        let stat = registry.stat_config();
        let interval_ms = match rule.stat_interval_ms {
            0 => stat.metric_interval_ms,
            interval => interval,
        };
        let node = registry.get_or_create(rule.stat_resource(), ResourceType::Common);

        if let Some(node) = &node {
            if interval_ms == stat.metric_interval_ms {
                return Ok(Self {
                    reuse_global: true,
                    interval_ms,
                    read_only: node.metric().clone(),
                    write_only: None,
                    node: Some(node.clone()),
                });
            }
            let bucket = node.bucket_array().bucket_length_ms();
            let interval = interval_ms as u64;
            if interval % bucket == 0
                && interval <= node.bucket_array().interval_ms()
                && node.bucket_array().interval_ms() % interval == 0
            {
                let view = node.generate_read_stat((interval / bucket) as u32, interval_ms)?;
                return Ok(Self {
                    reuse_global: false,
                    interval_ms,
                    read_only: view,
                    write_only: None,
                    node: Some(node.clone()),
                });
            }
        }

        let arr = Arc::new(BucketLeapArray::new(1, interval_ms, registry.time().clone())?);
        let view = Arc::new(SlidingWindow::new(1, interval_ms, arr.clone())?);
        Ok(Self {
            reuse_global: false,
            interval_ms,
            read_only: view,
            write_only: Some(arr),
            node,
        })
    }

    /// True when reading the resource's realtime window directly.
    pub fn reuse_global(&self) -> bool {
        self.reuse_global
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    pub fn read_only(&self) -> &Arc<dyn ReadStat> {
        &self.read_only
    }

    /// Present only for a private bucket array.
    pub fn write_only(&self) -> Option<&Arc<dyn WriteStat>> {
        self.write_only.as_ref()
    }

    /// Node of the resource whose statistics the rule reads.
    pub fn node(&self) -> Option<&Arc<ResourceNode>> {
        self.node.as_ref()
    }
}

/// Computes the threshold a check is held against.
#[derive(Debug)]
pub enum Calculator {
    Direct(DirectCalculator),
    WarmUp(WarmUpCalculator),
}

impl Calculator {
    pub fn calculate_allowed_tokens(&self, stat: &StandaloneStat) -> f64 {
        match self {
            Calculator::Direct(calculator) => calculator.calculate_allowed_tokens(),
            Calculator::WarmUp(calculator) => {
                calculator.calculate_allowed_tokens(stat.read_only().as_ref())
            }
        }
    }
}

/// Decides pass, block or wait against a threshold.
#[derive(Debug)]
pub enum Checker {
    Reject(RejectChecker),
    Throttling(ThrottlingChecker),
    Cluster(ClusterChecker),
}

/// One rule bound to its calculator, checker and statistics.
#[derive(Debug)]
pub struct TrafficShapingController {
    rule: Arc<FlowRule>,
    calculator: Calculator,
    checker: Checker,
    stat: StandaloneStat,
}

impl TrafficShapingController {
    /// Build the controller for a validated rule.
    pub fn new(
        rule: Arc<FlowRule>,
        registry: &NodeRegistry,
        token_service: Option<&Arc<dyn TokenService>>,
    ) -> Result<Self> {
        let stat = StandaloneStat::generate(&rule, registry)?;
        let time = registry.time().clone();

        let calculator = match rule.token_calculate_strategy {
            TokenCalculateStrategy::Direct => Calculator::Direct(DirectCalculator::new(rule.threshold)),
            TokenCalculateStrategy::WarmUp => Calculator::WarmUp(WarmUpCalculator::new(&rule, time.clone())),
        };

        let local = || match rule.control_behavior {
            ControlBehavior::Reject => Checker::Reject(RejectChecker::new(rule.metric_type)),
            ControlBehavior::Throttling => Checker::Throttling(ThrottlingChecker::new(
                stat.interval_ms(),
                rule.max_queueing_time_ms,
                time.clone(),
            )),
        };
        let checker = match (rule.cluster_mode, token_service) {
            (true, Some(service)) => Checker::Cluster(ClusterChecker::new(&rule, service.clone(), time.clone())),
            (true, None) => {
                warn!(
                    resource = %rule.resource,
                    "cluster rule without a token service, enforcing it locally"
                );
                local()
            }
            (false, _) => local(),
        };

        Ok(Self {
            rule,
            calculator,
            checker,
            stat,
        })
    }

    pub fn rule(&self) -> &Arc<FlowRule> {
        &self.rule
    }

    pub fn calculator(&self) -> &Calculator {
        &self.calculator
    }

    pub fn checker(&self) -> &Checker {
        &self.checker
    }

    pub fn stat(&self) -> &StandaloneStat {
        &self.stat
    }

    pub fn perform_checking(&self, batch_count: u32) -> TokenResult {
        let threshold = self.calculator.calculate_allowed_tokens(&self.stat);
        match &self.checker {
            Checker::Reject(checker) => checker.do_check(&self.rule, &self.stat, batch_count, threshold),
            Checker::Throttling(checker) => checker.do_check(&self.rule, batch_count, threshold),
            Checker::Cluster(checker) => checker.do_check(&self.rule, batch_count, threshold),
        }
    }
}
