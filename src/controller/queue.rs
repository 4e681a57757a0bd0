//! Deduplicating, rate-limited work queue.
//!
//! Items are identified by their informer key. A key is either pending
//! (waiting in the FIFO), processing (handed to a worker), or both when it was
//! pushed again while a worker held it; in that case it is re-queued by
//! [`WorkQueue::done`]. This keeps at most one reconciliation in flight per key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// Base delay of the per-key exponential backoff.
pub const BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Upper bound of the per-key exponential backoff.
pub const BACKOFF_MAX: Duration = Duration::from_secs(1000);

/// Kind of change that produced a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Fold a newer push into the operation already pending for the same key.
    pub fn merge(self, newer: Operation) -> Operation {
        match (self, newer) {
            (_, Operation::Delete) => Operation::Delete,
            (Operation::Delete, newer) => newer,
            (Operation::Create, _) | (_, Operation::Create) => Operation::Create,
            (Operation::Update, Operation::Update) => Operation::Update,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Unit of work: a resource key and the operation to dispatch for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueItem {
    pub key: String,
    pub operation: Operation,
}

impl QueueItem {
    pub fn new(key: impl Into<String>, operation: Operation) -> Self {
        Self {
            key: key.into(),
            operation,
        }
    }

    pub fn create(key: impl Into<String>) -> Self {
        Self::new(key, Operation::Create)
    }

    pub fn update(key: impl Into<String>) -> Self {
        Self::new(key, Operation::Update)
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(key, Operation::Delete)
    }
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ExponentialRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Default for ExponentialRateLimiter {
    fn default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_MAX)
    }
}

impl ExponentialRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);

        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Number of failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// FIFO order of keys waiting for a worker.
    order: VecDeque<String>,
    /// Pending operation per key; a key may be dirty while processing.
    dirty: HashMap<String, Operation>,
    /// Keys currently held by a worker.
    processing: HashSet<String>,
    shutting_down: bool,
}

/// Work queue shared by the watch callbacks (producers) and the workers.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: ExponentialRateLimiter,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an item, collapsing it into a pending item with the same key.
    pub fn push(&self, item: QueueItem) {
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }

        if let Some(pending) = state.dirty.get_mut(&item.key) {
            let merged = pending.merge(item.operation);
            debug!(key = %item.key, pending = %pending, merged = %merged, "Collapsing duplicate queue item");
            *pending = merged;
            return;
        }

        state.dirty.insert(item.key.clone(), item.operation);
        if state.processing.contains(&item.key) {
            // Re-queued by done() once the current worker releases the key
            return;
        }
        state.order.push_back(item.key);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    pub async fn pop(&self) -> Option<QueueItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                while let Some(key) = state.order.pop_front() {
                    let Some(operation) = state.dirty.remove(&key) else {
                        continue;
                    };
                    state.processing.insert(key.clone());
                    let more = !state.order.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on so idle workers drain the rest
                        self.notify.notify_one();
                    }
                    return Some(QueueItem { key, operation });
                }
            }
            notified.await;
        }
    }

    /// Release an item taken by [`pop`](Self::pop).
    ///
    /// If the key was pushed again while processing it is put back in line.
    pub fn done(&self, item: &QueueItem) {
        let mut state = self.state.lock();
        state.processing.remove(&item.key);
        if state.shutting_down || !state.dirty.contains_key(&item.key) {
            return;
        }
        state.order.push_back(item.key.clone());
        drop(state);
        self.notify.notify_one();
    }

    /// Re-enqueue an item after its key's backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, item: QueueItem) {
        let delay = self.limiter.when(&item.key);
        debug!(key = %item.key, delay_ms = delay.as_millis() as u64, "Requeueing with backoff");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(item);
        });
    }

    /// Number of rate-limited requeues recorded for `key`.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Clear the backoff state of `key` after a terminal outcome.
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    /// Number of keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Close the queue: pending items are discarded, later pushes are
    /// ignored, and every blocked [`pop`](Self::pop) returns `None`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        state.order.clear();
        state.dirty.clear();
        drop(state);
        self.notify.notify_waiters();
    }
}
