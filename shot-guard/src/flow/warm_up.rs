use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use super::FlowRule;
use crate::clock::TimeSource;
use crate::stat::MetricEvent;
use crate::stat::ReadStat;

/// Token-bucket warm-up: a cold resource starts at `threshold / cold_factor`
/// and ramps to `threshold` as traffic drains the stored tokens.
///
/// Tokens are refilled at `threshold` per second while the bucket sits below
/// the warning line, or at and above it while traffic stays low. Each second the
/// previous second's pass QPS is taken out. The more tokens above the warning
/// line, the lower the allowed rate.
#[derive(Debug)]
pub struct WarmUpCalculator {
    threshold: f64,
    cold_factor: u32,
    warning_token: u64,
    max_token: u64,
    slope: f64,
    stored_tokens: AtomicI64,
    last_filled_time: AtomicU64,
    time: TimeSource,
}

impl WarmUpCalculator {
    pub fn new(rule: &FlowRule, time: TimeSource) -> Self {
        let threshold = rule.threshold;
        let cold_factor = rule.warm_up_cold_factor.max(2);
        let period = rule.warm_up_period_sec as f64;

        let warning_token = (period * threshold / (cold_factor - 1) as f64) as u64;
        let max_token = warning_token + (2.0 * period * threshold / (1.0 + cold_factor as f64)) as u64;
        let slope = if threshold > 0.0 && max_token > warning_token {
            (cold_factor - 1) as f64 / threshold / (max_token - warning_token) as f64
        } else {
            0.0
        };

        Self {
            threshold,
            cold_factor,
            warning_token,
            max_token,
            slope,
            stored_tokens: AtomicI64::new(0),
            last_filled_time: AtomicU64::new(0),
            time,
        }
    }

    pub fn warning_token(&self) -> u64 {
        self.warning_token
    }

    pub fn max_token(&self) -> u64 {
        self.max_token
    }

    pub fn calculate_allowed_tokens(&self, stat: &dyn ReadStat) -> f64 {
        if self.threshold <= 0.0 {
            return 0.0;
        }
        self.sync_token(stat.previous_qps(MetricEvent::Pass));

        let rest = self.stored_tokens.load(Ordering::Acquire).max(0) as u64;
        if rest >= self.warning_token {
            let above = (rest - self.warning_token) as f64;
            1.0 / (above * self.slope + 1.0 / self.threshold)
        } else {
            self.threshold
        }
    }

    /// Refill and drain once per second.
    fn sync_token(&self, pass_qps: f64) {
        let now = self.time.now_ms();
        let current = now - now % 1_000;
        let last_filled = self.last_filled_time.load(Ordering::Acquire);
        if current <= last_filled {
            return;
        }

        let old = self.stored_tokens.load(Ordering::Acquire);
        let new = self.cool_down_tokens(current, last_filled, old, pass_qps);
        if self
            .stored_tokens
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let consumed = pass_qps as i64;
            if self.stored_tokens.fetch_sub(consumed, Ordering::AcqRel) - consumed < 0 {
                self.stored_tokens.store(0, Ordering::Release);
            }
            self.last_filled_time.store(current, Ordering::Release);
        }
    }

    fn cool_down_tokens(&self, current: u64, last_filled: u64, old: i64, pass_qps: f64) -> i64 {
        let warning = self.warning_token as i64;
        // Low traffic is judged in whole tokens
        let low_traffic = (self.threshold as u64 / self.cold_factor as u64) as f64;

        let new = if old < warning || pass_qps < low_traffic {
            let added = (current - last_filled) as f64 * self.threshold / 1_000.0;
            old.saturating_add(added as i64)
        } else {
            old
        };
        new.min(self.max_token as i64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::flow::TokenCalculateStrategy;
    use crate::flow::TrafficShapingController;
    use crate::flow::testing;

    fn rule() -> FlowRule {
        FlowRule {
            resource: "orders".into(),
            threshold: 10.0,
            token_calculate_strategy: TokenCalculateStrategy::WarmUp,
            warm_up_period_sec: 10,
            warm_up_cold_factor: 3,
            ..Default::default()
        }
    }

    #[test]
    fn token_geometry() {
        let (registry, _mock) = testing::registry();
        let calculator = WarmUpCalculator::new(&rule(), registry.time().clone());

        assert_eq!(calculator.warning_token(), 50);
        assert_eq!(calculator.max_token(), 100);
    }

    #[test]
    fn cold_start_allows_a_fraction_of_the_threshold() {
        let (registry, _mock) = testing::registry();
        let calculator = WarmUpCalculator::new(&rule(), registry.time().clone());
        let node = registry
            .get_or_create("orders", Default::default())
            .unwrap();

        let allowed = calculator.calculate_allowed_tokens(node.as_ref());
        assert!((allowed - 10.0 / 3.0).abs() < 1e-9, "allowed {allowed}");
    }

    #[test]
    fn ramps_up_under_sustained_traffic() {
        let (registry, mock) = testing::registry();
        let controller = TrafficShapingController::new(Arc::new(rule()), &registry, None).unwrap();
        let node = registry.get("orders").unwrap();

        let mut passed_per_second = Vec::new();
        for _ in 0..25 {
            let mut passed = 0;
            while controller.perform_checking(1).is_pass() {
                node.add_count(MetricEvent::Pass, 1);
                passed += 1;
            }
            passed_per_second.push(passed);
            mock.increment(Duration::from_secs(1));
        }

        assert_eq!(passed_per_second[0], 3);
        assert!(
            passed_per_second.windows(2).all(|w| w[0] <= w[1]),
            "{passed_per_second:?}"
        );
        assert_eq!(passed_per_second[24], 10);
    }

    #[test]
    fn idle_resource_cools_down_again() {
        let (registry, mock) = testing::registry();
        let controller = TrafficShapingController::new(Arc::new(rule()), &registry, None).unwrap();
        let node = registry.get("orders").unwrap();

        for _ in 0..25 {
            while controller.perform_checking(1).is_pass() {
                node.add_count(MetricEvent::Pass, 1);
            }
            mock.increment(Duration::from_secs(1));
        }
        assert!(controller.perform_checking(1).is_pass());

        // Ten quiet seconds refill the bucket to the top
        for _ in 0..10 {
            mock.increment(Duration::from_secs(1));
            controller.perform_checking(0);
        }
        let mut passed = 0;
        while controller.perform_checking(1).is_pass() {
            node.add_count(MetricEvent::Pass, 1);
            passed += 1;
        }
        assert_eq!(passed, 3);
    }
}
