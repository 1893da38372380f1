//! The per-call pipeline.
//!
//! Entry runs every prepare slot, then the rule-check slots until one of them
//! answers something other than `Pass`, then every stat slot. Exit runs the
//! stat slots' completion hooks. Slot failures never reach the caller: the
//! chain logs them and lets the call through. A failing stat slot is skipped
//! for that call alone, and only slots whose pass hook succeeded are completed.

mod resource;

use std::any::Any;
use std::fmt::Debug;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::error;
use tracing::warn;

pub use resource::ResourceNodePrepareSlot;
pub use resource::ResourceStatSlot;

use crate::base::BlockError;
use crate::base::EntryContext;
use crate::base::TokenResult;
use crate::error::Result;

/// Prepares the context, typically by selecting the resource's node. Never rejects.
pub trait StatPrepareSlot: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn prepare(&self, ctx: &mut EntryContext) -> Result<()>;
}

/// Decides whether a call may proceed. Must only read statistics.
pub trait RuleCheckSlot: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, ctx: &EntryContext) -> Result<TokenResult>;
}

/// Records the outcome of a call. The only kind of slot that writes counters.
pub trait StatSlot: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn on_entry_passed(&self, ctx: &EntryContext) -> Result<()>;

    fn on_entry_blocked(&self, ctx: &EntryContext, err: &BlockError) -> Result<()>;

    fn on_completed(&self, ctx: &EntryContext) -> Result<()>;
}

/// Ordered composition of slots.
#[derive(Debug, Default)]
pub struct SlotChain {
    stat_prepare: Vec<Arc<dyn StatPrepareSlot>>,
    rule_checks: Vec<Arc<dyn RuleCheckSlot>>,
    stats: Vec<Arc<dyn StatSlot>>,
}

impl SlotChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stat_prepare_slot_first(&mut self, slot: Arc<dyn StatPrepareSlot>) {
        self.stat_prepare.insert(0, slot);
    }

    pub fn add_stat_prepare_slot_last(&mut self, slot: Arc<dyn StatPrepareSlot>) {
        self.stat_prepare.push(slot);
    }

    pub fn add_rule_check_slot_first(&mut self, slot: Arc<dyn RuleCheckSlot>) {
        self.rule_checks.insert(0, slot);
    }

    pub fn add_rule_check_slot_last(&mut self, slot: Arc<dyn RuleCheckSlot>) {
        self.rule_checks.push(slot);
    }

    pub fn add_stat_slot_first(&mut self, slot: Arc<dyn StatSlot>) {
        self.stats.insert(0, slot);
    }

    pub fn add_stat_slot_last(&mut self, slot: Arc<dyn StatSlot>) {
        self.stats.push(slot);
    }

    /// Slot names in execution order, prepare then check then stat.
    pub fn slot_names(&self) -> Vec<&'static str> {
        self.stat_prepare
            .iter()
            .map(|s| s.name())
            .chain(self.rule_checks.iter().map(|s| s.name()))
            .chain(self.stats.iter().map(|s| s.name()))
            .collect()
    }

    /// Run the entry half of the pipeline.
    ///
    /// For `ShouldWait` the stat slots are not run yet: the caller sleeps and
    /// then calls [`SlotChain::on_waited`].
    pub fn entry(&self, ctx: &mut EntryContext) -> TokenResult {
        let result = guarded(ctx, "entry", |ctx| self.run_checks(ctx)).unwrap_or(TokenResult::Pass);
        ctx.set_rule_check_result(result.clone());
        if !ctx.is_faulted() {
            match &result {
                TokenResult::Pass => self.record_passed(ctx),
                TokenResult::Blocked(err) => self.record_blocked(ctx, err),
                TokenResult::ShouldWait(_) => {}
            }
        }
        result
    }

    /// Record a call that waited out a `ShouldWait` as passed.
    pub fn on_waited(&self, ctx: &mut EntryContext) {
        ctx.set_rule_check_result(TokenResult::Pass);
        if ctx.is_faulted() {
            return;
        }
        self.record_passed(ctx);
    }

    /// Run completion hooks of a passed call, once, for the stat slots that saw it pass.
    pub fn exit(&self, ctx: &mut EntryContext) {
        if ctx.is_faulted() || !ctx.rule_check_result().is_pass() {
            return;
        }
        let entered = ctx.take_entered_stat_slots();
        let ctx: &EntryContext = ctx;
        for slot in entered.into_iter().filter_map(|idx| self.stats.get(idx)) {
            contained(ctx, slot.name(), "exit", || slot.on_completed(ctx));
        }
    }

    fn run_checks(&self, ctx: &mut EntryContext) -> Result<TokenResult> {
        for slot in &self.stat_prepare {
            slot.prepare(ctx)?;
        }
        for slot in &self.rule_checks {
            let checked = slot.check(ctx)?;
            if !checked.is_pass() {
                return Ok(checked);
            }
        }
        Ok(TokenResult::Pass)
    }

    fn record_passed(&self, ctx: &mut EntryContext) {
        let shared: &EntryContext = ctx;
        let entered = self
            .stats
            .iter()
            .enumerate()
            .filter(|(_, slot)| contained(shared, slot.name(), "entry", || slot.on_entry_passed(shared)))
            .map(|(idx, _)| idx)
            .collect();
        ctx.set_entered_stat_slots(entered);
    }

    fn record_blocked(&self, ctx: &EntryContext, err: &BlockError) {
        for slot in &self.stats {
            contained(ctx, slot.name(), "entry", || slot.on_entry_blocked(ctx, err));
        }
    }
}

/// Fault boundary of the prepare and rule-check phases: an `Err` or a panic is
/// logged and the call is marked faulted, which skips all of its statistics.
fn guarded<T, F>(ctx: &mut EntryContext, stage: &'static str, f: F) -> Option<T>
where
    F: FnOnce(&mut EntryContext) -> Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| f(ctx))) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!(
                resource = ctx.resource().name(),
                stage,
                error = %err,
                "slot chain failed, letting the call through"
            );
            ctx.mark_faulted();
            None
        }
        Err(payload) => {
            error!(
                resource = ctx.resource().name(),
                stage,
                panic = panic_message(payload.as_ref()),
                "slot chain panicked, letting the call through"
            );
            ctx.mark_faulted();
            None
        }
    }
}

/// Fault boundary of a single stat slot hook. A failure only costs that slot
/// its record of the call; returns whether the hook succeeded.
fn contained<F>(ctx: &EntryContext, slot: &'static str, stage: &'static str, f: F) -> bool
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(
                resource = ctx.resource().name(),
                slot,
                stage,
                error = %err,
                "stat slot failed, skipping it for this call"
            );
            false
        }
        Err(payload) => {
            error!(
                resource = ctx.resource().name(),
                slot,
                stage,
                panic = panic_message(payload.as_ref()),
                "stat slot panicked, skipping it for this call"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}
