//! Workload kinds a SelectiveDeployment can place.
//!
//! The five kinds share one [`Workload`] trait so placement, ownership checks
//! and cleanup are written once and instantiated per kind.

use std::fmt;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::PodSpec;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::crd::{SelectiveDeployment, Workloads};
use crate::resources::common::{adopt_metadata, pin_to_nodes};

/// Kind of a child workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    Job,
    CronJob,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 5] = [
        WorkloadKind::Deployment,
        WorkloadKind::DaemonSet,
        WorkloadKind::StatefulSet,
        WorkloadKind::Job,
        WorkloadKind::CronJob,
    ];
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "Deployment"),
            WorkloadKind::DaemonSet => write!(f, "DaemonSet"),
            WorkloadKind::StatefulSet => write!(f, "StatefulSet"),
            WorkloadKind::Job => write!(f, "Job"),
            WorkloadKind::CronJob => write!(f, "CronJob"),
        }
    }
}

/// A namespaced workload whose pods can be pinned to nodes.
pub trait Workload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Serialize
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
    const KIND: WorkloadKind;

    /// Templates of this kind declared by a SelectiveDeployment.
    fn templates(workloads: &Workloads) -> &[Self];

    /// Pod spec of the workload's pod template.
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec>;
}

impl Workload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn templates(workloads: &Workloads) -> &[Self] {
        &workloads.deployment
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut()?.template.spec.as_mut()
    }
}

impl Workload for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn templates(workloads: &Workloads) -> &[Self] {
        &workloads.daemonset
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut()?.template.spec.as_mut()
    }
}

impl Workload for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn templates(workloads: &Workloads) -> &[Self] {
        &workloads.statefulset
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut()?.template.spec.as_mut()
    }
}

impl Workload for Job {
    const KIND: WorkloadKind = WorkloadKind::Job;

    fn templates(workloads: &Workloads) -> &[Self] {
        &workloads.job
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut()?.template.spec.as_mut()
    }
}

impl Workload for CronJob {
    const KIND: WorkloadKind = WorkloadKind::CronJob;

    fn templates(workloads: &Workloads) -> &[Self] {
        &workloads.cronjob
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec
            .as_mut()?
            .job_template
            .spec
            .as_mut()?
            .template
            .spec
            .as_mut()
    }
}

/// Build the object to apply for `template`: owned by `sd`, living in its
/// namespace and pinned to `nodes`.
pub fn generate_workload<W: Workload>(template: &W, sd: &SelectiveDeployment, nodes: &[String]) -> W {
    let mut workload = template.clone();
    adopt_metadata(workload.meta_mut(), sd);
    if let Some(spec) = workload.pod_spec_mut() {
        pin_to_nodes(spec, nodes);
    }
    workload
}
