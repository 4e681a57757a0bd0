//! Node readiness and recovery monitor.
//!
//! Node events re-trigger SelectiveDeployments that opted into recovery:
//!
//! - A node becoming usable (added ready, regained readiness, uncordoned) is a
//!   supply event. Only degraded deployments with evidence that more nodes
//!   could help are enqueued.
//! - A node becoming unusable (lost readiness, cordoned, addresses changed,
//!   deleted) disrupts existing placements. Every deployment placed on it is
//!   enqueued.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::common::ObjectKey;
use crate::controller::handler::Handler;
use crate::controller::informer::{Cache, EventHandler};
use crate::controller::queue::{QueueItem, WorkQueue};
use crate::crd::SelectiveDeployment;
use crate::health::HealthState;

/// Status of a node's `Ready` condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    True,
    False,
    Unknown,
}

/// Read the `Ready` condition. A node without one is `Unknown`.
pub fn readiness(node: &Node) -> Readiness {
    let status = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status.as_str());
    match status {
        Some("True") => Readiness::True,
        Some("False") => Readiness::False,
        _ => Readiness::Unknown,
    }
}

pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// Whether the node can receive new placements.
pub fn is_usable(node: &Node) -> bool {
    readiness(node) == Readiness::True && !is_unschedulable(node)
}

fn addresses(node: &Node) -> BTreeSet<(String, String)> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .into_iter()
        .flatten()
        .map(|a| (a.type_.clone(), a.address.clone()))
        .collect()
}

/// Whether the set of node addresses differs between two versions.
pub fn addresses_changed(old: &Node, new: &Node) -> bool {
    addresses(old) != addresses(new)
}

/// Why a SelectiveDeployment was enqueued by a node event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryReason {
    NodeAdded,
    BecameReady,
    BecameSchedulable,
    BecameUnready,
    BecameUnschedulable,
    AddressesChanged,
    NodeDeleted,
}

impl RecoveryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryReason::NodeAdded => "node_added",
            RecoveryReason::BecameReady => "node_ready",
            RecoveryReason::BecameSchedulable => "node_schedulable",
            RecoveryReason::BecameUnready => "node_unready",
            RecoveryReason::BecameUnschedulable => "node_unschedulable",
            RecoveryReason::AddressesChanged => "node_address_changed",
            RecoveryReason::NodeDeleted => "node_deleted",
        }
    }
}

impl fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effect of a node change on placements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTrigger {
    /// New capacity: recheck degraded deployments
    Supply(RecoveryReason),
    /// Placements on this node may be invalid
    Disruption(RecoveryReason),
}

/// Classify a node update. Regained capacity takes precedence over disruption.
pub fn classify_update(old: &Node, new: &Node) -> Option<NodeTrigger> {
    let (old_ready, new_ready) = (readiness(old), readiness(new));
    let (old_cordoned, new_cordoned) = (is_unschedulable(old), is_unschedulable(new));

    if old_ready != Readiness::True && new_ready == Readiness::True {
        return Some(NodeTrigger::Supply(RecoveryReason::BecameReady));
    }
    if old_cordoned && !new_cordoned {
        return Some(NodeTrigger::Supply(RecoveryReason::BecameSchedulable));
    }
    if old_ready == Readiness::True && new_ready != Readiness::True {
        return Some(NodeTrigger::Disruption(RecoveryReason::BecameUnready));
    }
    if !old_cordoned && new_cordoned {
        return Some(NodeTrigger::Disruption(RecoveryReason::BecameUnschedulable));
    }
    if !new_cordoned && new_ready == Readiness::True && addresses_changed(old, new) {
        return Some(NodeTrigger::Disruption(RecoveryReason::AddressesChanged));
    }
    None
}

/// Node callbacks feeding the work queue.
pub struct NodeMonitor {
    deployments: Arc<Cache<SelectiveDeployment>>,
    handler: Arc<dyn Handler>,
    queue: Arc<WorkQueue>,
    health: Option<Arc<HealthState>>,
}

impl NodeMonitor {
    pub fn new(
        deployments: Arc<Cache<SelectiveDeployment>>,
        handler: Arc<dyn Handler>,
        queue: Arc<WorkQueue>,
        health: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            deployments,
            handler,
            queue,
            health,
        }
    }

    /// Enqueue degraded deployments that more nodes could improve.
    fn recover_supply(&self, node: &str, reason: RecoveryReason) {
        for sd in self.deployments.list() {
            if !sd.wants_supply_recovery() {
                continue;
            }
            if let Some(key) = ObjectKey::from_resource(sd.as_ref()) {
                self.enqueue(node, key, reason);
            }
        }
    }

    /// Enqueue every recovering deployment placed on `node`.
    fn recover_owners(&self, node: &str, reason: RecoveryReason) {
        let Some(owners) = self.handler.owners_by_node(node) else {
            debug!(node = %node, reason = %reason, "Node owns no placements");
            return;
        };
        let owners: BTreeSet<ObjectKey> = owners.into_iter().collect();
        for key in owners {
            match self.deployments.get(&key) {
                Some(sd) if sd.spec.recovery => self.enqueue(node, key, reason),
                Some(_) => {}
                None => debug!(node = %node, sd = %key, "Owner no longer exists"),
            }
        }
    }

    fn enqueue(&self, node: &str, key: ObjectKey, reason: RecoveryReason) {
        info!(node = %node, sd = %key, reason = %reason, "Recovery started");
        if let Some(health) = &self.health {
            health.metrics.record_recovery_trigger(reason.as_str());
        }
        self.queue.push(QueueItem::update(key.to_string()));
    }
}

impl EventHandler<Node> for NodeMonitor {
    fn on_add(&self, node: &Node) {
        if readiness(node) == Readiness::True {
            self.recover_supply(&node.name_any(), RecoveryReason::NodeAdded);
        }
    }

    fn on_update(&self, old: &Node, new: &Node) {
        let name = new.name_any();
        match classify_update(old, new) {
            Some(NodeTrigger::Supply(reason)) => self.recover_supply(&name, reason),
            Some(NodeTrigger::Disruption(reason)) => self.recover_owners(&name, reason),
            None => {}
        }
    }

    fn on_delete(&self, node: &Node) {
        self.recover_owners(&node.name_any(), RecoveryReason::NodeDeleted);
    }
}
