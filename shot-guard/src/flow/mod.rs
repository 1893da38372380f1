//! Flow control: rules, the controllers built from them, and the slots that
//! consult them.

mod controller;
mod direct;
mod manager;
mod rule;
mod slot;
mod throttling;
mod warm_up;

pub use controller::Calculator;
pub use controller::Checker;
pub use controller::StandaloneStat;
pub use controller::TrafficShapingController;
pub use direct::DirectCalculator;
pub use direct::RejectChecker;
pub use manager::FlowRuleManager;
pub use rule::ControlBehavior;
pub use rule::FlowRule;
pub use rule::MAX_STAT_INTERVAL_MS;
pub use rule::MetricType;
pub use rule::RelationStrategy;
pub use rule::TokenCalculateStrategy;
pub use rule::is_valid_rule;
pub use slot::FlowSlot;
pub use slot::StandaloneStatSlot;
pub use throttling::ThrottlingChecker;
pub use warm_up::WarmUpCalculator;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use quanta::Clock;
    use quanta::Mock;

    use crate::clock::TimeSource;
    use crate::config::GuardConfig;
    use crate::stat::NodeRegistry;

    /// Registry on a mocked clock that starts on a whole second.
    pub(crate) fn registry() -> (Arc<NodeRegistry>, Arc<Mock>) {
        let (clock, mock) = Clock::mock();
        let time = TimeSource::with_clock(clock, 1_000_000);
        let registry = NodeRegistry::new(&GuardConfig::default(), time).unwrap();
        (Arc::new(registry), mock)
    }
}
