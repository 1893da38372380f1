use std::sync::Arc;
use std::time::Duration;

use super::FlowRuleManager;
use crate::base::BlockError;
use crate::base::EntryContext;
use crate::base::TokenResult;
use crate::error::Result;
use crate::slot::RuleCheckSlot;
use crate::slot::StatSlot;
use crate::stat::MetricEvent;

/// Checks every flow rule of the resource in load order.
///
/// A queued verdict does not end the walk: later rules still get to block the call.
#[derive(Debug)]
pub struct FlowSlot {
    manager: Arc<FlowRuleManager>,
}

impl FlowSlot {
    pub fn new(manager: Arc<FlowRuleManager>) -> Self {
        Self { manager }
    }
}

impl RuleCheckSlot for FlowSlot {
    fn name(&self) -> &'static str {
        "flow"
    }

    fn check(&self, ctx: &EntryContext) -> Result<TokenResult> {
        let snapshot = self.manager.snapshot();
        let Some(controllers) = snapshot.get(ctx.resource().name()) else {
            return Ok(TokenResult::Pass);
        };
        // A block from any rule wins; otherwise the call waits for the longest queue.
        let mut wait: Option<Duration> = None;
        for controller in controllers {
            match controller.perform_checking(ctx.batch_count()) {
                TokenResult::Pass => {}
                TokenResult::ShouldWait(d) => wait = Some(wait.map_or(d, |w| w.max(d))),
                blocked @ TokenResult::Blocked(_) => return Ok(blocked),
            }
        }
        Ok(wait.map_or(TokenResult::Pass, TokenResult::ShouldWait))
    }
}

/// Feeds passes into the private statistics of controllers that keep their own.
#[derive(Debug)]
pub struct StandaloneStatSlot {
    manager: Arc<FlowRuleManager>,
}

impl StandaloneStatSlot {
    pub fn new(manager: Arc<FlowRuleManager>) -> Self {
        Self { manager }
    }
}

impl StatSlot for StandaloneStatSlot {
    fn name(&self) -> &'static str {
        "flow_standalone_stat"
    }

    fn on_entry_passed(&self, ctx: &EntryContext) -> Result<()> {
        let snapshot = self.manager.snapshot();
        let Some(controllers) = snapshot.get(ctx.resource().name()) else {
            return Ok(());
        };
        for controller in controllers {
            if let Some(write) = controller.stat().write_only() {
                write.add_count(MetricEvent::Pass, ctx.batch_count() as u64);
            }
        }
        Ok(())
    }

    fn on_entry_blocked(&self, _ctx: &EntryContext, _err: &BlockError) -> Result<()> {
        Ok(())
    }

    fn on_completed(&self, _ctx: &EntryContext) -> Result<()> {
        Ok(())
    }
}
