use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::FlowRule;
use crate::base::BlockError;
use crate::base::TokenResult;
use crate::clock::TimeSource;

/// Leaky-bucket style shaping: calls are spaced `batch / threshold` of the
/// statistic interval apart and queue for at most `max_queueing_time`.
#[derive(Debug)]
pub struct ThrottlingChecker {
    stat_interval_ns: u64,
    max_queueing_time_ns: u64,
    /// Time (ns) at which the most recently admitted call was scheduled to pass.
    last_passed_time: AtomicU64,
    time: TimeSource,
}

impl ThrottlingChecker {
    pub fn new(stat_interval_ms: u32, max_queueing_time_ms: u32, time: TimeSource) -> Self {
        Self {
            stat_interval_ns: stat_interval_ms as u64 * 1_000_000,
            max_queueing_time_ns: max_queueing_time_ms as u64 * 1_000_000,
            last_passed_time: AtomicU64::new(0),
            time,
        }
    }

    pub fn do_check(&self, rule: &Arc<FlowRule>, batch_count: u32, threshold: f64) -> TokenResult {
        if batch_count == 0 {
            return TokenResult::Pass;
        }
        if threshold <= 0.0 {
            return blocked(rule, "threshold is not positive", threshold);
        }
        if batch_count as f64 > threshold {
            return blocked(rule, "batch count exceeds the threshold", batch_count as f64);
        }

        let now = self.time.now_ns();
        let cost = (batch_count as f64 / threshold * self.stat_interval_ns as f64).round() as u64;

        let latest = self.last_passed_time.load(Ordering::Acquire);
        if latest + cost <= now
            && self
                .last_passed_time
                .compare_exchange(latest, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return TokenResult::Pass;
        }

        // Reserve a slot behind everyone already queued
        let reserved = self.last_passed_time.fetch_add(cost, Ordering::AcqRel) + cost;
        let wait = reserved.saturating_sub(now);
        if wait > self.max_queueing_time_ns {
            self.last_passed_time.fetch_sub(cost, Ordering::AcqRel);
            return blocked(
                rule,
                "estimated queueing time exceeds the max queueing time",
                wait as f64 / 1_000_000.0,
            );
        }
        TokenResult::ShouldWait(Duration::from_nanos(wait))
    }
}

fn blocked(rule: &Arc<FlowRule>, message: &str, value: f64) -> TokenResult {
    TokenResult::Blocked(BlockError::flow(rule.clone(), message, value))
}

#[cfg(test)]
mod tests {
    use quanta::Clock;

    use super::*;
    use crate::flow::ControlBehavior;

    fn rule() -> Arc<FlowRule> {
        Arc::new(FlowRule {
            resource: "orders".into(),
            threshold: 10.0,
            control_behavior: ControlBehavior::Throttling,
            ..Default::default()
        })
    }

    #[test]
    fn queues_back_to_back_requests() {
        let (clock, _mock) = Clock::mock();
        let checker = ThrottlingChecker::new(1_000, 2_000, TimeSource::with_clock(clock, 1_000_000));
        let rule = rule();

        assert!(checker.do_check(&rule, 1, 10.0).is_pass());
        let mut last = Duration::ZERO;
        for n in 1..20 {
            match checker.do_check(&rule, 1, 10.0) {
                TokenResult::ShouldWait(wait) => {
                    assert_eq!(wait, Duration::from_millis(100 * n));
                    last = wait;
                }
                other => panic!("request {n} was not queued: {other:?}"),
            }
        }
        assert_eq!(last, Duration::from_millis(1_900));
    }

    #[test]
    fn blocks_without_queueing_time() {
        let (clock, _mock) = Clock::mock();
        let checker = ThrottlingChecker::new(1_000, 0, TimeSource::with_clock(clock, 1_000_000));
        let rule = rule();

        assert!(checker.do_check(&rule, 1, 10.0).is_pass());
        assert!(checker.do_check(&rule, 1, 10.0).is_blocked());
    }

    #[test]
    fn rejected_reservation_is_rolled_back() {
        let (clock, mock) = Clock::mock();
        let checker = ThrottlingChecker::new(1_000, 500, TimeSource::with_clock(clock, 1_000_000));
        let rule = rule();

        assert!(checker.do_check(&rule, 1, 10.0).is_pass());
        for _ in 0..5 {
            assert!(checker.do_check(&rule, 1, 10.0).is_wait());
        }
        let err = checker.do_check(&rule, 1, 10.0);
        assert_eq!(err.block_error().unwrap().triggered_value(), Some(600.0));

        // The queue still ends 500ms out, so 100ms later there is room again
        mock.increment(Duration::from_millis(100));
        assert_eq!(
            checker.do_check(&rule, 1, 10.0),
            TokenResult::ShouldWait(Duration::from_millis(500))
        );
    }

    #[test]
    fn passes_once_the_spacing_has_elapsed() {
        let (clock, mock) = Clock::mock();
        let checker = ThrottlingChecker::new(1_000, 0, TimeSource::with_clock(clock, 1_000_000));
        let rule = rule();

        for _ in 0..5 {
            assert!(checker.do_check(&rule, 1, 10.0).is_pass());
            mock.increment(Duration::from_millis(100));
        }
        assert!(checker.do_check(&rule, 0, 10.0).is_pass());
        assert!(checker.do_check(&rule, 1, 0.0).is_blocked());
        assert!(checker.do_check(&rule, 11, 10.0).is_blocked());
    }
}
