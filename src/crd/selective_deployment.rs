//! SelectiveDeployment Custom Resource Definition.
//!
//! A SelectiveDeployment declares a set of workload templates together with
//! node-selection criteria (geo labels, polygons, quantities). The controller
//! places the workloads only on matching nodes and keeps the placement
//! repaired as nodes join, leave or change readiness.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Substring that marks a status message as a quantity shortfall.
///
/// Statuses written before `fewerNodes` existed only carry this marker.
pub const FEWER_NODES_SENTINEL: &str = "Fewer nodes issue";

/// SelectiveDeployment places workloads on nodes picked by geo selectors.
///
/// Example:
/// ```yaml
/// apiVersion: apps.edgenet.io/v1alpha
/// kind: SelectiveDeployment
/// metadata:
///   name: web
///   namespace: demo
/// spec:
///   recovery: true
///   workloads:
///     deployment:
///       - metadata:
///           name: web
///         spec: { ... }
///   selectors:
///     - name: Country
///       value: ["FR", "DE"]
///       operator: In
///       quantity: 3
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.edgenet.io",
    version = "v1alpha",
    kind = "SelectiveDeployment",
    plural = "selectivedeployments",
    shortname = "sd",
    status = "SelectiveDeploymentStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Recovery", "type":"boolean", "jsonPath":".spec.recovery"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SelectiveDeploymentSpec {
    /// Workload templates to place on the selected nodes.
    #[serde(default)]
    pub workloads: Workloads,

    /// Node selection criteria, evaluated in order and unioned.
    #[serde(default)]
    pub selectors: Vec<Selector>,

    /// Re-trigger reconciliation when node conditions change.
    #[serde(default)]
    pub recovery: bool,
}

/// Child workload templates, one list per supported kind.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Workloads {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployment: Vec<Deployment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub daemonset: Vec<DaemonSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statefulset: Vec<StatefulSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub job: Vec<Job>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cronjob: Vec<CronJob>,
}

impl Workloads {
    /// Total number of workload templates across all kinds.
    pub fn len(&self) -> usize {
        self.deployment.len()
            + self.daemonset.len()
            + self.statefulset.len()
            + self.job.len()
            + self.cronjob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One selection criterion with a quantity bound.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    /// Which node attribute the values refer to.
    pub name: SelectorKind,

    /// Accepted values (label values, or JSON polygons for `Polygon`).
    #[serde(default)]
    pub value: Vec<String>,

    /// Whether matching nodes are included or excluded.
    #[serde(default)]
    pub operator: SelectorOperator,

    /// 0 selects every matching node, N > 0 at most N of them.
    #[serde(default)]
    pub quantity: i32,
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:?}", self.name, self.value)
    }
}

/// Node attribute targeted by a selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum SelectorKind {
    City,
    State,
    Country,
    Continent,
    Polygon,
}

impl std::fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorKind::City => write!(f, "City"),
            SelectorKind::State => write!(f, "State"),
            SelectorKind::Country => write!(f, "Country"),
            SelectorKind::Continent => write!(f, "Continent"),
            SelectorKind::Polygon => write!(f, "Polygon"),
        }
    }
}

/// Inclusion operator of a selector.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum SelectorOperator {
    #[default]
    In,
    NotIn,
}

/// Observed placement state of a SelectiveDeployment.
///
/// Written only by the reconciler; never set by users.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectiveDeploymentStatus {
    /// Aggregated result of the last reconciliation.
    pub state: DeploymentState,

    /// Placed workloads in "placed/total" format (e.g., "2/3").
    #[serde(default)]
    pub ready: String,

    /// Human-readable diagnostics from the last reconciliation.
    #[serde(default)]
    pub messages: Vec<String>,

    /// Set when at least one selector matched fewer nodes than requested.
    #[serde(default)]
    pub fewer_nodes: bool,

    /// Generation observed by the last reconciliation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Time of the last status write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl SelectiveDeploymentStatus {
    /// Whether the last reconciliation under-satisfied a quantity constraint.
    pub fn reports_fewer_nodes(&self) -> bool {
        self.fewer_nodes
            || self
                .messages
                .iter()
                .any(|m| m.contains(FEWER_NODES_SENTINEL))
    }
}

/// Placement state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum DeploymentState {
    /// Every selector fully satisfied and every workload placed.
    #[default]
    Success,
    /// Some selector under-satisfied its quantity, or some workloads failed.
    Partial,
    /// A selector matched nothing, a structural error occurred, or no workload could be placed.
    Failure,
}

impl DeploymentState {
    /// Recovery only re-triggers deployments that are not fully placed.
    pub fn is_degraded(&self) -> bool {
        matches!(self, DeploymentState::Partial | DeploymentState::Failure)
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentState::Success => write!(f, "Success"),
            DeploymentState::Partial => write!(f, "Partial"),
            DeploymentState::Failure => write!(f, "Failure"),
        }
    }
}

impl SelectiveDeployment {
    /// Last reconciled state, if the deployment has been reconciled at all.
    pub fn state(&self) -> Option<DeploymentState> {
        self.status.as_ref().map(|s| s.state)
    }

    /// Whether a node that became available could improve this placement.
    ///
    /// Requires recovery enabled and a degraded state. The first selector that
    /// either takes all matching nodes or has a recorded shortfall qualifies.
    pub fn wants_supply_recovery(&self) -> bool {
        if !self.spec.recovery {
            return false;
        }
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        if !status.state.is_degraded() {
            return false;
        }
        let fewer_nodes = status.reports_fewer_nodes();
        self.spec
            .selectors
            .iter()
            .any(|s| s.quantity == 0 || fewer_nodes)
    }
}
