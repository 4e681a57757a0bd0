//! Worker loop.
//!
//! Each worker pops items from the shared queue, resolves the
//! SelectiveDeployment from the cache and dispatches to the [`Handler`].
//! Retryable lookup failures are retried with backoff up to [`MAX_RETRIES`]
//! times before the item is dropped and reported. Other errors are dropped and
//! reported at once.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::controller::error::{ErrorReporter, Result};
use crate::controller::handler::Handler;
use crate::controller::informer::ObjectStore;
use crate::controller::queue::{Operation, QueueItem, WorkQueue};
use crate::controller::sd_watch::Tombstones;
use crate::crd::SelectiveDeployment;
use crate::health::HealthState;

/// Rate-limited requeues allowed per key before it is dropped.
pub const MAX_RETRIES: u32 = 5;

/// What a processed item led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Created,
    Updated,
    Deleted,
    /// Nothing to call: the cache no longer agrees with the queued operation
    Skipped,
}

/// Consumer of the work queue.
pub struct Worker {
    id: usize,
    queue: Arc<WorkQueue>,
    store: Arc<dyn ObjectStore<SelectiveDeployment>>,
    tombstones: Arc<Tombstones>,
    handler: Arc<dyn Handler>,
    reporter: Arc<dyn ErrorReporter>,
    health: Option<Arc<HealthState>>,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<WorkQueue>,
        store: Arc<dyn ObjectStore<SelectiveDeployment>>,
        tombstones: Arc<Tombstones>,
        handler: Arc<dyn Handler>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            id,
            queue,
            store,
            tombstones,
            handler,
            reporter,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Option<Arc<HealthState>>) -> Self {
        self.health = health;
        self
    }

    /// Process items until the queue shuts down.
    pub async fn run(self) {
        debug!(worker = self.id, "Worker started");
        while let Some(item) = self.queue.pop().await {
            self.process(&item).await;
        }
        debug!(worker = self.id, "Worker stopped");
    }

    /// Handle one popped item and release it.
    pub async fn process(&self, item: &QueueItem) {
        match self.dispatch(item).await {
            Ok(dispatch) => {
                debug!(worker = self.id, key = %item.key, operation = %item.operation, ?dispatch, "Processed");
                self.queue.forget(&item.key);
            }
            Err(e) if e.is_retryable() && self.queue.num_requeues(&item.key) < MAX_RETRIES => {
                warn!(
                    worker = self.id,
                    key = %item.key,
                    attempt = self.queue.num_requeues(&item.key) + 1,
                    error = %e,
                    "Error processing item, retrying"
                );
                self.queue.add_rate_limited(item.clone());
            }
            Err(e) => {
                self.queue.forget(&item.key);
                self.reporter.report(&item.key, &e);
                if let Some(health) = &self.health {
                    health.metrics.record_dropped();
                }
            }
        }
        self.queue.done(item);
        if let Some(health) = &self.health {
            health.metrics.set_queue_depth(self.queue.len());
        }
    }

    async fn dispatch(&self, item: &QueueItem) -> Result<Dispatch> {
        let sd = self.store.get_by_key(&item.key)?;
        let started = Instant::now();

        let dispatch = match (item.operation, sd) {
            (Operation::Create, Some(sd)) => {
                info!(key = %item.key, "Object created");
                self.handler.object_created(sd).await;
                Dispatch::Created
            }
            (Operation::Update, Some(sd)) => {
                info!(key = %item.key, "Object updated");
                self.handler.object_updated(sd).await;
                Dispatch::Updated
            }
            (Operation::Delete, None) => match self.tombstones.take(&item.key) {
                Some(last_known) => {
                    info!(key = %item.key, "Object deleted");
                    self.handler.object_deleted(last_known).await;
                    Dispatch::Deleted
                }
                None => {
                    warn!(key = %item.key, "No last known state for deleted object");
                    Dispatch::Skipped
                }
            },
            (Operation::Delete, Some(_)) => {
                debug!(key = %item.key, "Deleted object exists again, skipping");
                Dispatch::Skipped
            }
            (operation, None) => {
                debug!(key = %item.key, %operation, "Object no longer exists, skipping");
                Dispatch::Skipped
            }
        };

        if dispatch != Dispatch::Skipped {
            self.record(item, started);
        }
        Ok(dispatch)
    }

    fn record(&self, item: &QueueItem, started: Instant) {
        let Some(health) = &self.health else {
            return;
        };
        let (namespace, name) = item.key.split_once('/').unwrap_or(("", item.key.as_str()));
        health.metrics.record_dispatch(&item.operation.to_string());
        health
            .metrics
            .record_reconcile(namespace, name, started.elapsed().as_secs_f64());
        let now = u64::try_from(jiff::Timestamp::now().as_second()).unwrap_or(0);
        health.last_reconcile.store(now, Ordering::Relaxed);
    }
}
