use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;

use tracing::warn;

use super::TokenService;
use crate::base::BlockError;
use crate::base::TokenResult;
use crate::clock::TimeSource;
use crate::flow::FlowRule;

const NO_BUCKET: u64 = u64::MAX;

/// Enforces a rule's threshold across processes.
///
/// With a batch size above one, tokens are fetched from the service in
/// batches and handed out locally, so the service sees about
/// `threshold / batch_size` calls per interval however many callers there
/// are. Only one caller refills at a time; the others yield and retry.
#[derive(Debug)]
pub struct ClusterChecker {
    resource: String,
    stat_interval_ms: u32,
    batch_size: u32,
    local_tokens: AtomicI64,
    refilling: AtomicBool,
    /// Bucket in which the global quota ran out.
    exhausted_bucket: AtomicU64,
    service: Arc<dyn TokenService>,
    time: TimeSource,
}

impl ClusterChecker {
    pub fn new(rule: &FlowRule, service: Arc<dyn TokenService>, time: TimeSource) -> Self {
        Self {
            resource: rule.resource.clone(),
            stat_interval_ms: rule.stat_interval_ms.max(1),
            batch_size: rule.token_batch_size,
            local_tokens: AtomicI64::new(0),
            refilling: AtomicBool::new(false),
            exhausted_bucket: AtomicU64::new(NO_BUCKET),
            service,
            time,
        }
    }

    /// Tokens fetched but not yet handed out.
    pub fn local_tokens(&self) -> i64 {
        self.local_tokens.load(Ordering::Acquire)
    }

    pub fn do_check(&self, rule: &Arc<FlowRule>, batch_count: u32, threshold: f64) -> TokenResult {
        if self.batch_size <= 1 {
            return match self.acquire(batch_count) {
                Some(count) if count as f64 > threshold => blocked(rule, count as f64),
                _ => TokenResult::Pass,
            };
        }

        let need = batch_count as i64;
        loop {
            let available = self.local_tokens.load(Ordering::Acquire);
            if available >= need {
                if self
                    .local_tokens
                    .compare_exchange_weak(available, available - need, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return TokenResult::Pass;
                }
                continue;
            }

            let bucket = self.current_bucket();
            if self.exhausted_bucket.load(Ordering::Acquire) == bucket {
                return blocked(rule, threshold);
            }

            if self
                .refilling
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Someone may have refilled between our read and the lock
                if self.local_tokens.load(Ordering::Acquire) >= need {
                    self.refilling.store(false, Ordering::Release);
                    continue;
                }
                let result = self.refill(rule, need, threshold, bucket);
                self.refilling.store(false, Ordering::Release);
                return result;
            }
            thread::yield_now();
        }
    }

    /// One remote call for a batch. The caller holding the refill flag takes
    /// its own tokens out of the batch before publishing the rest.
    fn refill(&self, rule: &Arc<FlowRule>, need: i64, threshold: f64, bucket: u64) -> TokenResult {
        let fetch = (self.batch_size as i64).max(need);
        let Some(count) = self.acquire(fetch as u32) else {
            return TokenResult::Pass;
        };

        let limit = threshold.floor() as i64;
        if count >= limit {
            self.exhausted_bucket.store(bucket, Ordering::Release);
        }
        let granted = (limit - (count - fetch)).clamp(0, fetch);
        if granted < need {
            return blocked(rule, count as f64);
        }
        self.local_tokens.fetch_add(granted - need, Ordering::AcqRel);
        TokenResult::Pass
    }

    /// Ask the service; `None` when it failed and the call should pass.
    fn acquire(&self, count: u32) -> Option<i64> {
        match self
            .service
            .acquire_flow_token(&self.resource, count, self.stat_interval_ms)
        {
            Ok(total) => Some(total),
            Err(err) => {
                warn!(
                    resource = %self.resource,
                    error = %err,
                    "token service failed, letting the call through"
                );
                None
            }
        }
    }

    fn current_bucket(&self) -> u64 {
        let now = self.time.now_ms();
        now - now % self.stat_interval_ms as u64
    }
}

fn blocked(rule: &Arc<FlowRule>, value: f64) -> TokenResult {
    TokenResult::Blocked(BlockError::flow(
        rule.clone(),
        "cluster quota exhausted",
        value,
    ))
}
