//! Workload ownership monitor.
//!
//! Watches the child workload kinds. A workload that appears without a live
//! controlling SelectiveDeployment is offered to the deployment of the same
//! name, and a deleted workload sends its owners back through reconciliation
//! so it is re-created. Workload updates do not affect placement and are
//! ignored.

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::common::ObjectKey;
use crate::controller::informer::{Cache, EventHandler};
use crate::controller::queue::{QueueItem, WorkQueue};
use crate::crd::SelectiveDeployment;
use crate::resources::Workload;
use crate::resources::common::sd_owner_references;

/// How a workload relates to the SelectiveDeployments in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// Exactly one SelectiveDeployment owner reference, and that deployment exists
    Controlled(ObjectKey),
    /// No SelectiveDeployment owner reference
    Orphan,
    /// A single owner reference to a deployment missing from the cache
    Dangling(ObjectKey),
    /// More than one SelectiveDeployment owner reference
    Ambiguous,
}

/// Determine the ownership of a workload against the deployment cache.
pub fn ownership<W: ResourceExt>(workload: &W, deployments: &Cache<SelectiveDeployment>) -> Ownership {
    let namespace = workload.namespace();
    let references = sd_owner_references(workload.meta());
    match references.as_slice() {
        [] => Ownership::Orphan,
        [reference] => {
            let key = ObjectKey::new(namespace.as_deref(), &reference.name);
            if deployments.get(&key).is_some() {
                Ownership::Controlled(key)
            } else {
                Ownership::Dangling(key)
            }
        }
        _ => Ownership::Ambiguous,
    }
}

/// Callbacks for one workload kind.
pub struct WorkloadMonitor<W> {
    deployments: Arc<Cache<SelectiveDeployment>>,
    queue: Arc<WorkQueue>,
    _kind: PhantomData<fn() -> W>,
}

impl<W: Workload> WorkloadMonitor<W> {
    pub fn new(deployments: Arc<Cache<SelectiveDeployment>>, queue: Arc<WorkQueue>) -> Self {
        Self {
            deployments,
            queue,
            _kind: PhantomData,
        }
    }

    fn enqueue(&self, workload: &W, key: &ObjectKey, event: &str) {
        info!(
            kind = %W::KIND,
            workload = %workload.name_any(),
            sd = %key,
            event,
            "Workload change, recovery started"
        );
        self.queue.push(QueueItem::update(key.to_string()));
    }
}

impl<W: Workload> EventHandler<W> for WorkloadMonitor<W> {
    fn on_add(&self, workload: &W) {
        let ownership = ownership(workload, &self.deployments);
        if matches!(ownership, Ownership::Controlled(_)) {
            return;
        }
        // Out-of-band or early workloads are claimed by the deployment of the same name
        let candidate = ObjectKey::new(workload.namespace().as_deref(), &workload.name_any());
        if self.deployments.get(&candidate).is_some() {
            self.enqueue(workload, &candidate, "added");
        } else {
            debug!(kind = %W::KIND, workload = %workload.name_any(), ownership = ?ownership, "No owner to resolve");
        }
    }

    fn on_delete(&self, workload: &W) {
        let namespace = workload.namespace();
        let owners: BTreeSet<ObjectKey> = sd_owner_references(workload.meta())
            .into_iter()
            .map(|r| ObjectKey::new(namespace.as_deref(), &r.name))
            .collect();
        for key in owners {
            if self.deployments.get(&key).is_some() {
                self.enqueue(workload, &key, "deleted");
            }
        }
    }
}
