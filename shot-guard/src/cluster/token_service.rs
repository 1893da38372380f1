use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use tracing::warn;

use crate::clock::TimeSource;
use crate::config::ClusterConfig;
use crate::error::GuardError;
use crate::error::Result;

/// Hands out tokens from a quota shared between processes.
pub trait TokenService: Debug + Send + Sync {
    /// Take `acquire_count` tokens from the current `stat_interval_ms` bucket
    /// of `resource` and return the bucket's total after the increment.
    fn acquire_flow_token(&self, resource: &str, acquire_count: u32, stat_interval_ms: u32) -> Result<i64>;
}

/// A remote counter with expiry, in the manner of Redis `INCRBY` and `PEXPIRE`.
pub trait CounterStore: Debug + Send + Sync + 'static {
    fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

#[derive(Debug)]
struct ExpireTask {
    key: String,
    ttl: Duration,
}

/// `TokenService` on top of a `CounterStore`.
///
/// The first increment of a bucket key schedules its expiry on a bounded
/// queue. A worker thread applies expiries and retries failed ones after a
/// backoff until they succeed. While it retries it stops taking from the
/// queue, so the queue fills up and new keys are expired inline instead. An
/// inline expiry that fails goes to a backlog the worker drains first. Once
/// the backlog holds `expire_queue_capacity` keys, acquisitions are refused
/// before they create another key.
#[derive(Debug)]
pub struct TokenServer<S> {
    store: Arc<S>,
    time: TimeSource,
    expire_tx: mpsc::Sender<ExpireTask>,
    backlog: Arc<Mutex<VecDeque<ExpireTask>>>,
    backlog_capacity: usize,
}

impl<S: CounterStore> TokenServer<S> {
    pub fn new(store: Arc<S>, time: TimeSource, config: &ClusterConfig) -> Result<Self> {
        if config.expire_queue_capacity == 0 {
            return Err(GuardError::InvalidConfig(
                "expire_queue_capacity must be positive".into(),
            ));
        }
        let (expire_tx, expire_rx) = mpsc::channel(config.expire_queue_capacity);
        let backlog = Arc::new(Mutex::new(VecDeque::new()));
        let worker = ExpireWorker {
            store: store.clone(),
            rx: expire_rx,
            backlog: backlog.clone(),
            backoff: Duration::from_millis(config.expire_retry_backoff_ms),
        };
        thread::Builder::new()
            .name("token-server-expire".into())
            .spawn(move || worker.run())
            .map_err(|err| GuardError::InvalidConfig(format!("cannot start expiry worker: {err}")))?;

        Ok(Self {
            store,
            time,
            expire_tx,
            backlog,
            backlog_capacity: config.expire_queue_capacity,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn schedule_expire(&self, key: String, ttl: Duration) {
        match self.expire_tx.try_send(ExpireTask { key, ttl }) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) | Err(TrySendError::Closed(task)) => {
                warn!(key = %task.key, "expiry queue unavailable, expiring inline");
                if let Err(err) = self.store.expire(&task.key, task.ttl) {
                    warn!(key = %task.key, error = %err, "failed to set key expiry, moving it to the backlog");
                    self.backlog.lock().push_back(task);
                }
            }
        }
    }
}

impl<S: CounterStore> TokenService for TokenServer<S> {
    fn acquire_flow_token(&self, resource: &str, acquire_count: u32, stat_interval_ms: u32) -> Result<i64> {
        let interval = stat_interval_ms.max(1) as u64;
        let now = self.time.now_ms();
        let key = format!("{resource}:{}", now - now % interval);

        if self.backlog.lock().len() >= self.backlog_capacity {
            return Err(GuardError::TokenService(
                "expiry backlog is full, refusing to create more keys".into(),
            ));
        }
        let count = self.store.incr_by(&key, acquire_count as i64)?;
        if count == acquire_count as i64 {
            self.schedule_expire(key, Duration::from_millis(interval));
        }
        Ok(count)
    }
}

struct ExpireWorker<S> {
    store: Arc<S>,
    rx: mpsc::Receiver<ExpireTask>,
    backlog: Arc<Mutex<VecDeque<ExpireTask>>>,
    backoff: Duration,
}

impl<S: CounterStore> ExpireWorker<S> {
    /// Runs until the server is dropped and every pending expiry is applied.
    ///
    /// Holds at most one failed task at a time and does not read the queue
    /// until it goes through.
    fn run(mut self) {
        let mut retry: Option<ExpireTask> = None;
        loop {
            let next = retry.take().or_else(|| self.backlog.lock().pop_front());
            let task = match next {
                Some(task) => task,
                None => match self.rx.blocking_recv() {
                    Some(task) => task,
                    None => match self.backlog.lock().pop_front() {
                        Some(task) => task,
                        None => break,
                    },
                },
            };

            if let Err(err) = self.store.expire(&task.key, task.ttl) {
                warn!(key = %task.key, error = %err, "failed to set key expiry, retrying");
                retry = Some(task);
                thread::sleep(self.backoff);
            }
        }
        debug!("expiry worker stopped");
    }
}
