use std::sync::Arc;

use super::StatPrepareSlot;
use super::StatSlot;
use crate::base::BlockError;
use crate::base::EntryContext;
use crate::base::TrafficType;
use crate::error::Result;
use crate::stat::DEFAULT_STATISTIC_MAX_RT;
use crate::stat::MetricEvent;
use crate::stat::NodeRegistry;
use crate::stat::ResourceNode;

/// Looks up (or creates) the resource's node and stores it in the context.
#[derive(Debug)]
pub struct ResourceNodePrepareSlot {
    registry: Arc<NodeRegistry>,
}

impl ResourceNodePrepareSlot {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }
}

impl StatPrepareSlot for ResourceNodePrepareSlot {
    fn name(&self) -> &'static str {
        "resource_node_prepare"
    }

    fn prepare(&self, ctx: &mut EntryContext) -> Result<()> {
        let resource = ctx.resource();
        if let Some(node) = self
            .registry
            .get_or_create(resource.name(), resource.classification())
        {
            ctx.set_stat_node(node);
        }
        Ok(())
    }
}

/// Records pass, block and completion on the resource's node, and on the
/// inbound aggregate for inbound traffic.
#[derive(Debug)]
pub struct ResourceStatSlot {
    registry: Arc<NodeRegistry>,
}

impl ResourceStatSlot {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    fn for_each_node(&self, ctx: &EntryContext, f: impl Fn(&ResourceNode)) {
        if let Some(node) = ctx.stat_node() {
            f(node);
        }
        if ctx.resource().traffic_type() == TrafficType::Inbound {
            f(self.registry.inbound_node());
        }
    }
}

impl StatSlot for ResourceStatSlot {
    fn name(&self) -> &'static str {
        "resource_stat"
    }

    fn on_entry_passed(&self, ctx: &EntryContext) -> Result<()> {
        let batch = ctx.batch_count() as u64;
        self.for_each_node(ctx, |node| {
            node.increase_concurrency();
            node.add_count(MetricEvent::Pass, batch);
        });
        Ok(())
    }

    fn on_entry_blocked(&self, ctx: &EntryContext, _err: &BlockError) -> Result<()> {
        let batch = ctx.batch_count() as u64;
        self.for_each_node(ctx, |node| node.add_count(MetricEvent::Block, batch));
        Ok(())
    }

    fn on_completed(&self, ctx: &EntryContext) -> Result<()> {
        let rt = self
            .registry
            .time()
            .now_ms()
            .saturating_sub(ctx.start_time_ms())
            .min(DEFAULT_STATISTIC_MAX_RT);
        let batch = ctx.batch_count() as u64;
        let failed = ctx.error().is_some();
        self.for_each_node(ctx, |node| {
            node.record_completion(rt, batch, failed);
            node.decrease_concurrency();
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use quanta::Clock;

    use super::*;
    use crate::base::EntryInput;
    use crate::base::ResourceType;
    use crate::base::ResourceWrapper;
    use crate::clock::TimeSource;
    use crate::config::GuardConfig;
    use crate::slot::SlotChain;

    #[test]
    fn records_on_resource_and_inbound_nodes() {
        let (clock, mock) = Clock::mock();
        let time = TimeSource::with_clock(clock, 0);
        let registry = Arc::new(NodeRegistry::new(&GuardConfig::default(), time.clone()).unwrap());
        let mut chain = SlotChain::new();
        chain.add_stat_prepare_slot_last(Arc::new(ResourceNodePrepareSlot::new(registry.clone())));
        chain.add_stat_slot_last(Arc::new(ResourceStatSlot::new(registry.clone())));

        let resource = ResourceWrapper::new("orders", ResourceType::Web, TrafficType::Inbound);
        let mut ctx = EntryContext::new(
            resource,
            EntryInput {
                batch_count: 2,
                flag: 0,
            },
            time.now_ms(),
        );
        assert!(chain.entry(&mut ctx).is_pass());

        let node = registry.get("orders").unwrap();
        assert_eq!(node.current_concurrency(), 1);
        assert_eq!(node.pass_qps(), 2.0);
        assert_eq!(registry.inbound_node().pass_qps(), 2.0);

        mock.increment(Duration::from_millis(30));
        ctx.set_error("boom");
        chain.exit(&mut ctx);

        assert_eq!(node.current_concurrency(), 0);
        assert_eq!(node.complete_qps(), 2.0);
        assert_eq!(node.error_qps(), 2.0);
        assert_eq!(node.min_rt(), 30.0);
        assert_eq!(registry.inbound_node().current_concurrency(), 0);
    }

    #[test]
    fn outbound_traffic_skips_inbound_node() {
        let registry = Arc::new(NodeRegistry::new(&GuardConfig::default(), TimeSource::new()).unwrap());
        let slot = ResourceStatSlot::new(registry.clone());
        let mut ctx = EntryContext::new(
            ResourceWrapper::new("db", ResourceType::DbSql, TrafficType::Outbound),
            EntryInput::default(),
            registry.time().now_ms(),
        );
        ResourceNodePrepareSlot::new(registry.clone())
            .prepare(&mut ctx)
            .unwrap();
        slot.on_entry_passed(&ctx).unwrap();

        assert_eq!(registry.get("db").unwrap().current_concurrency(), 1);
        assert_eq!(registry.inbound_node().current_concurrency(), 0);
    }
}
