use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::warn;

use super::FlowRule;
use super::TrafficShapingController;
use crate::cluster::TokenService;
use crate::error::Result;
use crate::stat::NodeRegistry;

/// Controllers of every resource with at least one valid rule.
pub type ControllerMap = HashMap<String, Vec<Arc<TrafficShapingController>>>;

/// Holds the live flow rules.
///
/// Readers take a snapshot of the controller map and never see a partially
/// applied load. Loads are serialized by `current_rules`, which also holds the
/// rule set as last passed in for the idempotence check.
#[derive(Debug)]
pub struct FlowRuleManager {
    registry: Arc<NodeRegistry>,
    token_service: Option<Arc<dyn TokenService>>,
    controllers: RwLock<Arc<ControllerMap>>,
    current_rules: Mutex<Vec<FlowRule>>,
}

impl FlowRuleManager {
    pub fn new(registry: Arc<NodeRegistry>, token_service: Option<Arc<dyn TokenService>>) -> Self {
        Self {
            registry,
            token_service,
            controllers: RwLock::new(Arc::new(HashMap::new())),
            current_rules: Mutex::new(Vec::new()),
        }
    }

    /// Replace the whole rule set.
    ///
    /// Returns `Ok(false)` if `rules` equals the current set. Invalid rules are
    /// dropped with a warning. A controller whose rule is unchanged is carried
    /// over with its state.
    pub fn load_rules(&self, rules: Vec<FlowRule>) -> Result<bool> {
        let mut current = self.current_rules.lock();
        if *current == rules {
            debug!(rules = rules.len(), "flow rules unchanged, skipping load");
            return Ok(false);
        }

        let mut reusable: ControllerMap = (**self.controllers.read()).clone();
        let mut next = ControllerMap::new();
        let mut dropped = 0;
        let mut reused = 0;

        for rule in &rules {
            if let Err(err) = rule.validate() {
                warn!(rule = %rule, error = %err, "ignoring invalid flow rule");
                dropped += 1;
                continue;
            }

            let previous = reusable.get_mut(&rule.resource).and_then(|controllers| {
                controllers
                    .iter()
                    .position(|c| c.rule().as_ref() == rule)
                    .map(|idx| controllers.swap_remove(idx))
            });
            let controller = match previous {
                Some(controller) => {
                    reused += 1;
                    controller
                }
                None => {
                    match TrafficShapingController::new(
                        Arc::new(rule.clone()),
                        &self.registry,
                        self.token_service.as_ref(),
                    ) {
                        Ok(controller) => Arc::new(controller),
                        Err(err) => {
                            warn!(rule = %rule, error = %err, "failed to build flow controller");
                            dropped += 1;
                            continue;
                        }
                    }
                }
            };
            next.entry(rule.resource.clone()).or_default().push(controller);
        }

        *self.controllers.write() = Arc::new(next);
        debug!(
            loaded = rules.len() - dropped,
            dropped, reused, "flow rules loaded"
        );
        *current = rules;
        Ok(true)
    }

    pub fn clear_rules(&self) -> Result<bool> {
        self.load_rules(Vec::new())
    }

    /// The current controller map. Cheap: one `Arc` clone under a read lock.
    pub fn snapshot(&self) -> Arc<ControllerMap> {
        self.controllers.read().clone()
    }

    /// Every rule that made it into a controller.
    pub fn rules(&self) -> Vec<FlowRule> {
        self.snapshot()
            .values()
            .flatten()
            .map(|c| c.rule().as_ref().clone())
            .collect()
    }

    pub fn rules_of(&self, resource: &str) -> Vec<Arc<FlowRule>> {
        self.controllers_of(resource)
            .iter()
            .map(|c| c.rule().clone())
            .collect()
    }

    pub fn controllers_of(&self, resource: &str) -> Vec<Arc<TrafficShapingController>> {
        self.snapshot().get(resource).cloned().unwrap_or_default()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ControlBehavior;
    use crate::flow::testing;

    fn rule(resource: &str, threshold: f64) -> FlowRule {
        FlowRule {
            resource: resource.into(),
            threshold,
            ..Default::default()
        }
    }

    #[test]
    fn identical_load_is_a_no_op() {
        let (registry, _mock) = testing::registry();
        let manager = FlowRuleManager::new(registry, None);
        let rules = vec![rule("orders", 10.0), rule("payments", 5.0)];

        assert!(manager.load_rules(rules.clone()).unwrap());
        let before = manager.controllers_of("orders");

        assert!(!manager.load_rules(rules).unwrap());
        let after = manager.controllers_of("orders");
        assert!(Arc::ptr_eq(&before[0], &after[0]));
    }

    #[test]
    fn unchanged_rules_keep_their_controllers() {
        let (registry, _mock) = testing::registry();
        let manager = FlowRuleManager::new(registry, None);
        let throttled = FlowRule {
            control_behavior: ControlBehavior::Throttling,
            max_queueing_time_ms: 500,
            ..rule("orders", 10.0)
        };

        manager
            .load_rules(vec![throttled.clone(), rule("payments", 5.0)])
            .unwrap();
        let kept = manager.controllers_of("orders");
        let replaced = manager.controllers_of("payments");

        assert!(manager
            .load_rules(vec![throttled, rule("payments", 6.0)])
            .unwrap());
        assert!(Arc::ptr_eq(&kept[0], &manager.controllers_of("orders")[0]));
        assert!(!Arc::ptr_eq(&replaced[0], &manager.controllers_of("payments")[0]));
        assert_eq!(manager.rules_of("payments")[0].threshold, 6.0);
    }

    #[test]
    fn invalid_rules_are_dropped() {
        let (registry, _mock) = testing::registry();
        let manager = FlowRuleManager::new(registry, None);

        assert!(manager
            .load_rules(vec![rule("orders", 10.0), rule("", 1.0), rule("payments", -3.0)])
            .unwrap());
        assert_eq!(manager.rules(), vec![rule("orders", 10.0)]);
        assert!(manager.rules_of("payments").is_empty());
    }

    #[test]
    fn duplicate_rules_get_separate_controllers() {
        let (registry, _mock) = testing::registry();
        let manager = FlowRuleManager::new(registry, None);

        manager
            .load_rules(vec![rule("orders", 10.0), rule("orders", 10.0)])
            .unwrap();
        let first = manager.controllers_of("orders");
        assert_eq!(first.len(), 2);
        assert!(!Arc::ptr_eq(&first[0], &first[1]));

        // Reloading with one more rule reuses both
        manager
            .load_rules(vec![rule("orders", 10.0), rule("orders", 10.0), rule("orders", 3.0)])
            .unwrap();
        let second = manager.controllers_of("orders");
        assert_eq!(second.len(), 3);
        assert!(second[..2].iter().all(|c| first.iter().any(|f| Arc::ptr_eq(c, f))));
    }

    #[test]
    fn clear_removes_everything() {
        let (registry, _mock) = testing::registry();
        let manager = FlowRuleManager::new(registry, None);
        manager.load_rules(vec![rule("orders", 10.0)]).unwrap();

        assert!(manager.clear_rules().unwrap());
        assert!(manager.rules().is_empty());
        assert!(!manager.clear_rules().unwrap());
    }
}
