use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quanta::Clock;
use tracing::trace;

use crate::base::BlockError;
use crate::base::EntryContext;
use crate::base::EntryInput;
use crate::base::ResourceType;
use crate::base::ResourceWrapper;
use crate::base::TokenResult;
use crate::base::TrafficType;
use crate::clock::TimeSource;
use crate::cluster::TokenService;
use crate::config::GuardConfig;
use crate::error::Result;
use crate::flow::FlowRule;
use crate::flow::FlowRuleManager;
use crate::flow::FlowSlot;
use crate::flow::StandaloneStatSlot;
use crate::slot::ResourceNodePrepareSlot;
use crate::slot::ResourceStatSlot;
use crate::slot::SlotChain;
use crate::stat::NodeRegistry;
use crate::stat::ResourceNode;

type ChainCustomizer = Box<dyn FnOnce(&mut SlotChain) + Send>;

/// Options of a single `entry` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryOptions {
    resource_type: ResourceType,
    traffic_type: TrafficType,
    input: EntryInput,
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn traffic_type(mut self, traffic_type: TrafficType) -> Self {
        self.traffic_type = traffic_type;
        self
    }

    pub fn batch_count(mut self, batch_count: u32) -> Self {
        self.input.batch_count = batch_count;
        self
    }

    pub fn flag(mut self, flag: i32) -> Self {
        self.input.flag = flag;
        self
    }
}

/// Builds a [`Sentinel`].
#[derive(Default)]
pub struct SentinelBuilder {
    config: GuardConfig,
    time: Option<TimeSource>,
    token_service: Option<Arc<dyn TokenService>>,
    customizers: Vec<ChainCustomizer>,
}

impl SentinelBuilder {
    pub fn config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    /// Drive statistics from `clock`, e.g. `Clock::mock()`, starting at `base_ms`.
    pub fn clock(mut self, clock: Clock, base_ms: u64) -> Self {
        self.time = Some(TimeSource::with_clock(clock, base_ms));
        self
    }

    pub fn time_source(mut self, time: TimeSource) -> Self {
        self.time = Some(time);
        self
    }

    /// Service used by cluster-mode rules. Without one they are enforced locally.
    pub fn token_service(mut self, service: Arc<dyn TokenService>) -> Self {
        self.token_service = Some(service);
        self
    }

    /// Adjust the slot chain after the built-in slots are registered.
    pub fn customize_chain<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut SlotChain) + Send + 'static,
    {
        self.customizers.push(Box::new(f));
        self
    }

    pub fn build(self) -> Result<Sentinel> {
        let time = self.time.unwrap_or_default();
        let registry = Arc::new(NodeRegistry::new(&self.config, time.clone())?);
        let flow_rules = Arc::new(FlowRuleManager::new(registry.clone(), self.token_service));

        let mut chain = SlotChain::new();
        chain.add_stat_prepare_slot_last(Arc::new(ResourceNodePrepareSlot::new(registry.clone())));
        chain.add_rule_check_slot_last(Arc::new(FlowSlot::new(flow_rules.clone())));
        chain.add_stat_slot_last(Arc::new(ResourceStatSlot::new(registry.clone())));
        chain.add_stat_slot_last(Arc::new(StandaloneStatSlot::new(flow_rules.clone())));
        for customize in self.customizers {
            customize(&mut chain);
        }

        Ok(Sentinel {
            config: self.config,
            registry,
            flow_rules,
            chain: Arc::new(chain),
            time,
        })
    }
}

impl fmt::Debug for SentinelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentinelBuilder")
            .field("config", &self.config)
            .field("token_service", &self.token_service)
            .field("customizers", &self.customizers.len())
            .finish()
    }
}

/// The admission-control facade: load rules, then wrap work in
/// [`Sentinel::entry`] and [`Entry::exit`].
#[derive(Debug)]
pub struct Sentinel {
    config: GuardConfig,
    registry: Arc<NodeRegistry>,
    flow_rules: Arc<FlowRuleManager>,
    chain: Arc<SlotChain>,
    time: TimeSource,
}

impl Sentinel {
    pub fn builder() -> SentinelBuilder {
        SentinelBuilder::default()
    }

    /// A guard with default configuration and the system clock.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn load_flow_rules(&self, rules: Vec<FlowRule>) -> Result<bool> {
        self.flow_rules.load_rules(rules)
    }

    pub fn flow_rules(&self) -> &Arc<FlowRuleManager> {
        &self.flow_rules
    }

    /// Ask to enter `resource` without waiting. A queued call comes back as
    /// [`Admission::Queued`] and must be admitted once its wait is over.
    pub fn try_entry(
        &self,
        resource: &str,
        options: EntryOptions,
    ) -> std::result::Result<Admission, BlockError> {
        let mut ctx = self.context(resource, options);
        match self.chain.entry(&mut ctx) {
            TokenResult::Pass => Ok(Admission::Admitted(self.admitted(ctx))),
            TokenResult::Blocked(err) => Err(err),
            TokenResult::ShouldWait(wait) => {
                trace!(resource, ?wait, "queueing call");
                let pending = PendingEntry {
                    ctx,
                    chain: self.chain.clone(),
                };
                Ok(Admission::Queued(pending, wait))
            }
        }
    }

    /// Ask to enter `resource`, sleeping the thread if a rule queues the call.
    pub fn entry(&self, resource: &str, options: EntryOptions) -> std::result::Result<Entry, BlockError> {
        match self.try_entry(resource, options)? {
            Admission::Admitted(entry) => Ok(entry),
            Admission::Queued(pending, wait) => {
                thread::sleep(wait);
                Ok(pending.admit())
            }
        }
    }

    /// [`Sentinel::entry`] for async callers: queueing awaits a tokio timer.
    pub async fn entry_async(
        &self,
        resource: &str,
        options: EntryOptions,
    ) -> std::result::Result<Entry, BlockError> {
        match self.try_entry(resource, options)? {
            Admission::Admitted(entry) => Ok(entry),
            Admission::Queued(pending, wait) => {
                tokio::time::sleep(wait).await;
                Ok(pending.admit())
            }
        }
    }

    pub fn node(&self, resource: &str) -> Option<Arc<ResourceNode>> {
        self.registry.get(resource)
    }

    pub fn inbound_node(&self) -> &Arc<ResourceNode> {
        self.registry.inbound_node()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn slot_chain(&self) -> &Arc<SlotChain> {
        &self.chain
    }

    pub fn time(&self) -> &TimeSource {
        &self.time
    }

    fn context(&self, resource: &str, options: EntryOptions) -> EntryContext {
        EntryContext::new(
            ResourceWrapper::new(resource, options.resource_type, options.traffic_type),
            options.input,
            self.time.now_ms(),
        )
    }

    fn admitted(&self, ctx: EntryContext) -> Entry {
        Entry {
            ctx,
            chain: self.chain.clone(),
            exited: false,
        }
    }
}

/// Result of [`Sentinel::try_entry`] for a call that was not blocked.
#[derive(Debug)]
pub enum Admission {
    Admitted(Entry),
    /// Admit with [`PendingEntry::admit`] after the wait.
    Queued(PendingEntry, Duration),
}

/// A call that holds a queue slot but has not been admitted yet.
///
/// Dropping it gives up the call; the slot it reserved is not returned.
#[derive(Debug)]
#[must_use = "a queued call is only counted once admitted"]
pub struct PendingEntry {
    ctx: EntryContext,
    chain: Arc<SlotChain>,
}

impl PendingEntry {
    pub fn context(&self) -> &EntryContext {
        &self.ctx
    }

    /// Record the call as passed and hand out its entry.
    pub fn admit(mut self) -> Entry {
        self.chain.on_waited(&mut self.ctx);
        Entry {
            ctx: self.ctx,
            chain: self.chain,
            exited: false,
        }
    }
}

/// An admitted call. Exits when dropped if not exited explicitly.
#[derive(Debug)]
#[must_use = "dropping an Entry exits it immediately"]
pub struct Entry {
    ctx: EntryContext,
    chain: Arc<SlotChain>,
    exited: bool,
}

impl Entry {
    pub fn context(&self) -> &EntryContext {
        &self.ctx
    }

    /// Mark the call as failed; it is counted as an error on exit.
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.ctx.set_error(error);
    }

    pub fn exit(mut self) {
        self.do_exit();
    }

    fn do_exit(&mut self) {
        if !self.exited {
            self.exited = true;
            self.chain.exit(&mut self.ctx);
        }
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.do_exit();
    }
}
