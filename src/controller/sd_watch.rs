//! SelectiveDeployment watch callbacks.
//!
//! Adds become `Create` items and deletes become `Delete` items. Updates are
//! only queued when the status is unchanged, so status writes made by the
//! reconciler do not trigger another reconciliation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::controller::common::ObjectKey;
use crate::controller::informer::EventHandler;
use crate::controller::queue::{QueueItem, WorkQueue};
use crate::crd::SelectiveDeployment;

/// Last known state of deleted SelectiveDeployments, kept until the worker
/// dispatches the deletion.
#[derive(Debug, Default)]
pub struct Tombstones {
    inner: Mutex<HashMap<String, Arc<SelectiveDeployment>>>,
}

impl Tombstones {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: String, sd: Arc<SelectiveDeployment>) {
        self.inner.lock().insert(key, sd);
    }

    pub fn take(&self, key: &str) -> Option<Arc<SelectiveDeployment>> {
        self.inner.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Callbacks for the SelectiveDeployment informer.
pub struct DeploymentWatch {
    queue: Arc<WorkQueue>,
    tombstones: Arc<Tombstones>,
}

impl DeploymentWatch {
    pub fn new(queue: Arc<WorkQueue>, tombstones: Arc<Tombstones>) -> Self {
        Self { queue, tombstones }
    }
}

impl EventHandler<SelectiveDeployment> for DeploymentWatch {
    fn on_add(&self, sd: &SelectiveDeployment) {
        let Some(key) = ObjectKey::from_resource(sd) else {
            return;
        };
        let key = key.to_string();
        // A re-created deployment supersedes a pending deletion
        self.tombstones.take(&key);
        self.queue.push(QueueItem::create(key));
    }

    fn on_update(&self, old: &SelectiveDeployment, new: &SelectiveDeployment) {
        let Some(key) = ObjectKey::from_resource(new) else {
            return;
        };
        if old.status != new.status {
            debug!(sd = %key, "Skipping status-only update");
            return;
        }
        self.queue.push(QueueItem::update(key.to_string()));
    }

    fn on_delete(&self, sd: &SelectiveDeployment) {
        let Some(key) = ObjectKey::from_resource(sd) else {
            return;
        };
        let key = key.to_string();
        self.tombstones.record(key.clone(), Arc::new(sd.clone()));
        self.queue.push(QueueItem::delete(key));
    }
}
