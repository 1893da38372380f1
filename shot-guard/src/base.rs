//! Types shared by every stage of the pipeline: how a call site is identified,
//! what a rule check can answer and the per-call context that carries both.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::flow::FlowRule;
use crate::stat::ResourceNode;

/// Classification of a resource, used for grouping and export only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    #[default]
    Common,
    Web,
    Rpc,
    ApiGateway,
    DbSql,
    Cache,
    Mq,
}

/// Direction of traffic through a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrafficType {
    Inbound,
    #[default]
    Outbound,
}

/// Identifies a call site. Cheap to clone, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceWrapper {
    name: Arc<str>,
    classification: ResourceType,
    traffic_type: TrafficType,
}

impl ResourceWrapper {
    pub fn new(name: impl Into<Arc<str>>, classification: ResourceType, traffic_type: TrafficType) -> Self {
        Self {
            name: name.into(),
            classification,
            traffic_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn classification(&self) -> ResourceType {
        self.classification
    }

    pub fn traffic_type(&self) -> TrafficType {
        self.traffic_type
    }
}

impl fmt::Display for ResourceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {:?})",
            self.name, self.classification, self.traffic_type
        )
    }
}

/// Why a call was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Flow,
    Other,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockType::Flow => f.write_str("flow"),
            BlockType::Other => f.write_str("other"),
        }
    }
}

/// The only rejection a caller ever sees: a rule decided to block the call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{block_type} control blocked resource `{resource}`: {message}")]
pub struct BlockError {
    block_type: BlockType,
    resource: String,
    message: String,
    rule: Option<Arc<FlowRule>>,
    triggered_value: Option<f64>,
}

impl BlockError {
    pub fn new(block_type: BlockType, resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            block_type,
            resource: resource.into(),
            message: message.into(),
            rule: None,
            triggered_value: None,
        }
    }

    /// A flow block caused by `rule` when the observed value was `triggered_value`.
    pub fn flow(rule: Arc<FlowRule>, message: impl Into<String>, triggered_value: f64) -> Self {
        Self {
            block_type: BlockType::Flow,
            resource: rule.resource.clone(),
            message: message.into(),
            rule: Some(rule),
            triggered_value: Some(triggered_value),
        }
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn rule(&self) -> Option<&Arc<FlowRule>> {
        self.rule.as_ref()
    }

    pub fn triggered_value(&self) -> Option<f64> {
        self.triggered_value
    }
}

/// Outcome of a rule check.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenResult {
    Pass,
    Blocked(BlockError),
    /// Pass after the caller has slept for the duration.
    ShouldWait(Duration),
}

impl TokenResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, TokenResult::Pass)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, TokenResult::Blocked(_))
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, TokenResult::ShouldWait(_))
    }

    pub fn block_error(&self) -> Option<&BlockError> {
        match self {
            TokenResult::Blocked(err) => Some(err),
            _ => None,
        }
    }
}

/// Caller supplied input of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInput {
    /// Number of tokens the call consumes.
    pub batch_count: u32,
    /// Free-form flag for custom slots.
    pub flag: i32,
}

impl Default for EntryInput {
    fn default() -> Self {
        Self {
            batch_count: 1,
            flag: 0,
        }
    }
}

/// Mutable state of one call as it moves through the slot chain.
pub struct EntryContext {
    resource: ResourceWrapper,
    input: EntryInput,
    stat_node: Option<Arc<ResourceNode>>,
    start_time_ms: u64,
    rule_check_result: TokenResult,
    error: Option<String>,
    faulted: bool,
    entered_stat_slots: Vec<usize>,
    data: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl EntryContext {
    pub fn new(resource: ResourceWrapper, input: EntryInput, start_time_ms: u64) -> Self {
        Self {
            resource,
            input,
            stat_node: None,
            start_time_ms,
            rule_check_result: TokenResult::Pass,
            error: None,
            faulted: false,
            entered_stat_slots: Vec::new(),
            data: HashMap::new(),
        }
    }

    pub fn resource(&self) -> &ResourceWrapper {
        &self.resource
    }

    pub fn input(&self) -> &EntryInput {
        &self.input
    }

    pub fn batch_count(&self) -> u32 {
        self.input.batch_count
    }

    pub fn stat_node(&self) -> Option<&Arc<ResourceNode>> {
        self.stat_node.as_ref()
    }

    pub fn set_stat_node(&mut self, node: Arc<ResourceNode>) {
        self.stat_node = Some(node);
    }

    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    pub fn rule_check_result(&self) -> &TokenResult {
        &self.rule_check_result
    }

    pub(crate) fn set_rule_check_result(&mut self, result: TokenResult) {
        self.rule_check_result = result;
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    /// True once a prepare or rule-check slot has failed and the chain let the
    /// call through unchecked; its statistics are skipped.
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub(crate) fn mark_faulted(&mut self) {
        self.faulted = true;
    }

    /// Stat slots, by chain position, whose pass hook ran and now owe a completion.
    pub(crate) fn set_entered_stat_slots(&mut self, entered: Vec<usize>) {
        self.entered_stat_slots = entered;
    }

    pub(crate) fn take_entered_stat_slots(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.entered_stat_slots)
    }

    /// Attach data for slots further down the chain.
    pub fn insert_data<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.data.insert(key.into(), Box::new(value));
    }

    pub fn data<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.data.get(key).and_then(|v| v.downcast_ref::<T>())
    }
}

impl fmt::Debug for EntryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryContext")
            .field("resource", &self.resource)
            .field("input", &self.input)
            .field("start_time_ms", &self.start_time_ms)
            .field("rule_check_result", &self.rule_check_result)
            .field("error", &self.error)
            .field("faulted", &self.faulted)
            .field("entered_stat_slots", &self.entered_stat_slots)
            .field("data_keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_data_is_typed() {
        let resource = ResourceWrapper::new("orders", ResourceType::Web, TrafficType::Inbound);
        let mut ctx = EntryContext::new(resource, EntryInput::default(), 0);

        ctx.insert_data("tenant", String::from("acme"));
        ctx.insert_data("weight", 3_u32);

        assert_eq!(ctx.data::<String>("tenant").map(String::as_str), Some("acme"));
        assert_eq!(ctx.data::<u32>("weight"), Some(&3));
        // Wrong type or missing key both read as absent
        assert_eq!(ctx.data::<u64>("weight"), None);
        assert_eq!(ctx.data::<u32>("missing"), None);
    }

    #[test]
    fn block_error_carries_rule() {
        let rule = Arc::new(FlowRule {
            resource: "orders".into(),
            threshold: 10.0,
            ..Default::default()
        });
        let err = BlockError::flow(rule.clone(), "qps exceeded", 10.0);

        assert_eq!(err.block_type(), BlockType::Flow);
        assert_eq!(err.resource(), "orders");
        assert_eq!(err.rule(), Some(&rule));
        assert_eq!(err.triggered_value(), Some(10.0));
        assert_eq!(
            err.to_string(),
            "flow control blocked resource `orders`: qps exceeded"
        );
    }
}
