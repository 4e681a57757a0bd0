//! Common resource generation utilities.
//!
//! Labels, owner references and node pinning shared by every workload kind a
//! SelectiveDeployment can carry.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::SelectiveDeployment;

/// Field manager name for server-side apply and events
pub const FIELD_MANAGER: &str = "selective-deployment-controller";

/// Label carrying the name of the owning SelectiveDeployment
pub const OWNER_LABEL: &str = "edge-net.io/selective-deployment";

/// Well-known node label matched by the injected node affinity
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Standard labels applied to all managed workloads
pub fn standard_labels(sd: &SelectiveDeployment) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );
    labels.insert(OWNER_LABEL.to_string(), sd.name_any());
    labels
}

/// Controller owner reference pointing at a SelectiveDeployment
pub fn owner_reference(sd: &SelectiveDeployment) -> OwnerReference {
    OwnerReference {
        api_version: SelectiveDeployment::api_version(&()).to_string(),
        kind: SelectiveDeployment::kind(&()).to_string(),
        name: sd.name_any(),
        uid: sd.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Owner references of kind SelectiveDeployment
pub fn sd_owner_references(meta: &ObjectMeta) -> Vec<&OwnerReference> {
    let kind = SelectiveDeployment::kind(&());
    meta.owner_references
        .iter()
        .flatten()
        .filter(|r| r.kind == kind)
        .collect()
}

/// The SelectiveDeployment owner reference flagged as controller, if any
pub fn controlling_sd(meta: &ObjectMeta) -> Option<&OwnerReference> {
    sd_owner_references(meta)
        .into_iter()
        .find(|r| r.controller == Some(true))
}

/// Required node affinity restricting pods to the given node names
pub fn node_affinity(nodes: &[String]) -> NodeAffinity {
    NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: HOSTNAME_LABEL.to_string(),
                    operator: "In".to_string(),
                    values: Some(nodes.to_vec()),
                }]),
                ..Default::default()
            }],
        }),
        ..Default::default()
    }
}

/// Pin a pod spec to `nodes`, replacing any node affinity it carried.
pub fn pin_to_nodes(spec: &mut PodSpec, nodes: &[String]) {
    spec.affinity
        .get_or_insert_with(Affinity::default)
        .node_affinity = Some(node_affinity(nodes));
}

/// Stamp namespace, labels and the owner reference of `sd` onto `meta`.
pub fn adopt_metadata(meta: &mut ObjectMeta, sd: &SelectiveDeployment) {
    meta.namespace = sd.namespace();
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .extend(standard_labels(sd));
    meta.owner_references = Some(vec![owner_reference(sd)]);
    meta.resource_version = None;
    meta.uid = None;
}
