//! Reconciliation logic for SelectiveDeployment.
//!
//! [`SelectiveDeploymentReconciler`] is the [`Handler`] the workers dispatch
//! to. A reconciliation resolves the selectors against the node cache, applies
//! every workload template pinned to the selected nodes, records the placement
//! in the ownership index and writes the resulting status.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Node;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::controller::common::ObjectKey;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::handler::Handler;
use crate::controller::informer::Cache;
use crate::controller::ownership::OwnershipIndex;
use crate::controller::selection::CompiledSelector;
use crate::controller::status::{StatusBuilder, status_changed};
use crate::crd::{DeploymentState, SelectiveDeployment};
use crate::resources::common::{FIELD_MANAGER, controlling_sd};
use crate::resources::{Workload, generate_workload};

/// Nodes chosen for a SelectiveDeployment plus the status observations so far.
#[derive(Debug)]
pub struct Placement {
    pub nodes: Vec<String>,
    pub status: StatusBuilder,
}

/// Resolve every selector against `nodes` and union the results.
///
/// `current` is the previous placement, kept where possible when a selector
/// limits its quantity.
pub fn plan_placement<'n, I>(sd: &SelectiveDeployment, nodes: I, current: &BTreeSet<String>) -> Placement
where
    I: IntoIterator<Item = &'n Node>,
    I::IntoIter: Clone,
{
    let nodes = nodes.into_iter();
    let mut status = StatusBuilder::new(sd.spec.workloads.len());
    let mut selected = BTreeSet::new();

    for selector in &sd.spec.selectors {
        match CompiledSelector::compile(selector) {
            Ok(compiled) => {
                let matched = compiled.select(nodes.clone(), current);
                status.selector(selector, matched.len());
                selected.extend(matched);
            }
            Err(e) => {
                debug!(sd = %sd.name_any(), selector = %selector, error = %e, "Malformed selector");
                status.geojson_error(selector);
            }
        }
    }

    Placement {
        nodes: selected.into_iter().collect(),
        status,
    }
}

/// Whether `existing` is controlled by a SelectiveDeployment other than `sd`.
fn owned_elsewhere<W: Workload>(existing: &W, sd: &SelectiveDeployment) -> bool {
    controlling_sd(existing.meta()).is_some_and(|owner| match sd.uid() {
        Some(uid) => owner.uid != uid,
        None => owner.name != sd.name_any(),
    })
}

/// Handler backed by the Kubernetes API and the node cache.
pub struct SelectiveDeploymentReconciler {
    ctx: Context,
    nodes: Arc<Cache<Node>>,
    ownership: Arc<OwnershipIndex>,
}

impl SelectiveDeploymentReconciler {
    pub fn new(ctx: Context, nodes: Arc<Cache<Node>>, ownership: Arc<OwnershipIndex>) -> Self {
        Self {
            ctx,
            nodes,
            ownership,
        }
    }

    async fn reconcile(&self, sd: &SelectiveDeployment) -> Result<DeploymentState> {
        let key = ObjectKey::from_resource(sd)
            .ok_or_else(|| Error::Validation("SelectiveDeployment without a name".to_string()))?;
        let namespace = sd
            .namespace()
            .ok_or_else(|| Error::Validation(format!("{key} has no namespace")))?;

        let nodes = self.nodes.list();
        let current = self.ownership.nodes_of(&key);
        let Placement {
            nodes: selected,
            mut status,
        } = plan_placement(sd, nodes.iter().map(|node| &**node), &current);

        if selected.is_empty() {
            info!(sd = %key, "No node selected, workloads not applied");
            status.not_applied(sd.spec.workloads.len());
        } else {
            self.apply_workloads::<Deployment>(sd, &namespace, &selected, &mut status).await;
            self.apply_workloads::<DaemonSet>(sd, &namespace, &selected, &mut status).await;
            self.apply_workloads::<StatefulSet>(sd, &namespace, &selected, &mut status).await;
            self.apply_workloads::<Job>(sd, &namespace, &selected, &mut status).await;
            self.apply_workloads::<CronJob>(sd, &namespace, &selected, &mut status).await;
        }
        self.ownership.assign(&key, selected.iter().cloned());

        let next = status.build(sd.state(), sd.metadata.generation);
        let state = next.state;
        if status_changed(sd.status.as_ref(), &next) {
            let api: Api<SelectiveDeployment> = Api::namespaced(self.ctx.client.clone(), &namespace);
            let patch = serde_json::json!({ "status": next });
            api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            info!(sd = %key, state = %state, ready = %next.ready, nodes = selected.len(), "Status updated");
        }
        Ok(state)
    }

    async fn apply_workloads<W: Workload>(
        &self,
        sd: &SelectiveDeployment,
        namespace: &str,
        nodes: &[String],
        status: &mut StatusBuilder,
    ) {
        let api: Api<W> = Api::namespaced(self.ctx.client.clone(), namespace);
        for template in W::templates(&sd.spec.workloads) {
            let name = template.name_any();
            if name.is_empty() {
                status.creation_failure(W::KIND, &name);
                continue;
            }
            match api.get_opt(&name).await {
                Ok(Some(existing)) if owned_elsewhere(&existing, sd) => {
                    warn!(kind = %W::KIND, name = %name, sd = %sd.name_any(), "Workload owned by another SelectiveDeployment");
                    status.in_use(W::KIND, &name);
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(kind = %W::KIND, name = %name, error = %e, "Failed to read workload");
                    status.creation_failure(W::KIND, &name);
                    continue;
                }
            }

            let workload = generate_workload(template, sd, nodes);
            if let Err(e) = api
                .patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&workload),
                )
                .await
            {
                warn!(kind = %W::KIND, name = %name, error = %e, "Failed to apply workload");
                status.creation_failure(W::KIND, &name);
            }
        }
    }

    /// Delete the workloads of `sd` that it still controls.
    async fn delete_workloads<W: Workload>(&self, sd: &SelectiveDeployment, namespace: &str) {
        let api: Api<W> = Api::namespaced(self.ctx.client.clone(), namespace);
        for template in W::templates(&sd.spec.workloads) {
            let name = template.name_any();
            let existing = match api.get_opt(&name).await {
                Ok(Some(existing)) => existing,
                Ok(None) => continue,
                Err(e) => {
                    warn!(kind = %W::KIND, name = %name, error = %e, "Failed to read workload");
                    continue;
                }
            };
            if controlling_sd(existing.meta()).is_none() || owned_elsewhere(&existing, sd) {
                continue;
            }
            match api.delete(&name, &DeleteParams::background()).await {
                Ok(_) => info!(kind = %W::KIND, name = %name, "Workload deleted"),
                Err(e) => {
                    let e = Error::from(e);
                    if !e.is_not_found() {
                        warn!(kind = %W::KIND, name = %name, error = %e, "Failed to delete workload");
                    }
                }
            }
        }
    }

    async fn report(&self, sd: &SelectiveDeployment, action: &str, result: Result<DeploymentState>) {
        match result {
            Ok(DeploymentState::Success) => {
                self.ctx
                    .publish_normal_event(sd, "Reconciled", action, Some("Workloads placed".to_string()))
                    .await;
            }
            Ok(state) => {
                self.ctx
                    .publish_warning_event(sd, "Degraded", action, Some(format!("Placement is {state}")))
                    .await;
            }
            Err(e) => {
                warn!(sd = %sd.name_any(), error = %e, "Reconciliation failed");
                self.ctx
                    .publish_warning_event(sd, "ReconcileFailed", action, Some(e.to_string()))
                    .await;
            }
        }
    }
}

#[async_trait]
impl Handler for SelectiveDeploymentReconciler {
    async fn init(&self, client: &Client) -> Result<()> {
        let api: Api<SelectiveDeployment> = Api::all(client.clone());
        api.list(&ListParams::default().limit(1)).await?;
        info!("SelectiveDeployment API reachable");
        Ok(())
    }

    async fn object_created(&self, sd: Arc<SelectiveDeployment>) {
        let result = self.reconcile(&sd).await;
        self.report(&sd, "Create", result).await;
    }

    async fn object_updated(&self, sd: Arc<SelectiveDeployment>) {
        let result = self.reconcile(&sd).await;
        self.report(&sd, "Update", result).await;
    }

    async fn object_deleted(&self, sd: Arc<SelectiveDeployment>) {
        let Some(key) = ObjectKey::from_resource(sd.as_ref()) else {
            return;
        };
        self.ownership.release(&key);
        let Some(namespace) = sd.namespace() else {
            return;
        };
        self.delete_workloads::<Deployment>(&sd, &namespace).await;
        self.delete_workloads::<DaemonSet>(&sd, &namespace).await;
        self.delete_workloads::<StatefulSet>(&sd, &namespace).await;
        self.delete_workloads::<Job>(&sd, &namespace).await;
        self.delete_workloads::<CronJob>(&sd, &namespace).await;
        info!(sd = %key, "Released placement");
    }

    fn owners_by_node(&self, node: &str) -> Option<Vec<ObjectKey>> {
        self.ownership.owners_of(node)
    }
}
