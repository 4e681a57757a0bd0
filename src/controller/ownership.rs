//! Node ownership bookkeeping.
//!
//! Records which nodes each SelectiveDeployment was last placed on. The
//! reconciler writes it after every reconciliation; the node monitor reads the
//! reverse view (node → owning deployments) from watch callbacks.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::controller::common::ObjectKey;

#[derive(Debug, Default)]
struct Index {
    by_owner: HashMap<ObjectKey, BTreeSet<String>>,
    by_node: HashMap<String, BTreeSet<ObjectKey>>,
}

/// Thread-safe two-way index between SelectiveDeployments and nodes.
#[derive(Debug, Default)]
pub struct OwnershipIndex {
    inner: RwLock<Index>,
}

impl OwnershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the node set of `owner`.
    pub fn assign<I, S>(&self, owner: &ObjectKey, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes: BTreeSet<String> = nodes.into_iter().map(Into::into).collect();
        let mut index = self.inner.write();
        Self::unlink(&mut index, owner);
        if nodes.is_empty() {
            return;
        }
        for node in &nodes {
            index
                .by_node
                .entry(node.clone())
                .or_default()
                .insert(owner.clone());
        }
        index.by_owner.insert(owner.clone(), nodes);
    }

    /// Drop every entry of `owner`.
    pub fn release(&self, owner: &ObjectKey) {
        let mut index = self.inner.write();
        Self::unlink(&mut index, owner);
    }

    /// Deployments placed on `node`, or `None` if the node owns nothing.
    pub fn owners_of(&self, node: &str) -> Option<Vec<ObjectKey>> {
        self.inner
            .read()
            .by_node
            .get(node)
            .map(|owners| owners.iter().cloned().collect())
    }

    /// Nodes last assigned to `owner`.
    pub fn nodes_of(&self, owner: &ObjectKey) -> BTreeSet<String> {
        self.inner
            .read()
            .by_owner
            .get(owner)
            .cloned()
            .unwrap_or_default()
    }

    fn unlink(index: &mut Index, owner: &ObjectKey) {
        let Some(previous) = index.by_owner.remove(owner) else {
            return;
        };
        for node in previous {
            if let Some(owners) = index.by_node.get_mut(&node) {
                owners.remove(owner);
                if owners.is_empty() {
                    index.by_node.remove(&node);
                }
            }
        }
    }
}
