//! Status management utilities.
//!
//! [`StatusMessage`] renders the diagnostics shown in `status.messages`, and
//! [`StatusBuilder`] collects them together with the reconciliation outcome
//! to produce the next status.

use std::fmt;

use crate::controller::state_machine::{DeploymentStateMachine, ReconcileOutcome, determine_event};
use crate::crd::{DeploymentState, FEWER_NODES_SENTINEL, SelectiveDeploymentStatus, Selector};
use crate::resources::WorkloadKind;

/// Diagnostic reported in the resource status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMessage {
    /// Every workload was created without issue
    Success,
    /// The API server rejected a workload
    CreationFailure { kind: WorkloadKind, name: String },
    /// A workload of the same name is controlled by another SelectiveDeployment
    InUse { kind: WorkloadKind, name: String },
    /// A selector matched fewer nodes than its quantity
    FewerNodes {
        found: usize,
        requested: usize,
        selector: String,
    },
    /// A selector without a quantity matched no node
    NoMatch { selector: String },
    /// A polygon selector could not be parsed
    GeoJsonError { selector: String },
}

impl StatusMessage {
    pub fn fewer_nodes(found: usize, requested: usize, selector: &Selector) -> Self {
        StatusMessage::FewerNodes {
            found,
            requested,
            selector: selector.to_string(),
        }
    }

    pub fn no_match(selector: &Selector) -> Self {
        StatusMessage::NoMatch {
            selector: selector.to_string(),
        }
    }

    pub fn geojson_error(selector: &Selector) -> Self {
        StatusMessage::GeoJsonError {
            selector: selector.to_string(),
        }
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusMessage::Success => {
                write!(f, "The selective deployment smoothly created the workload(s)")
            }
            StatusMessage::CreationFailure { kind, name } => {
                write!(f, "{kind} {name} could not be created")
            }
            StatusMessage::InUse { kind, name } => write!(
                f,
                "{kind} {name} is already under the control of another selective deployment"
            ),
            StatusMessage::FewerNodes {
                found,
                requested,
                selector,
            } => write!(
                f,
                "{FEWER_NODES_SENTINEL}, {found} node(s) found instead of {requested} for {selector}"
            ),
            StatusMessage::NoMatch { selector } => write!(f, "No node matches {selector}"),
            StatusMessage::GeoJsonError { selector } => {
                write!(f, "{selector} has a GeoJSON format error")
            }
        }
    }
}

/// Builder for the status written after a reconciliation
#[derive(Debug, Default)]
pub struct StatusBuilder {
    outcome: ReconcileOutcome,
    messages: Vec<StatusMessage>,
}

impl StatusBuilder {
    /// Start a status for a resource asking for `workloads` workloads.
    pub fn new(workloads: usize) -> Self {
        Self {
            outcome: ReconcileOutcome::new(workloads),
            messages: Vec::new(),
        }
    }

    /// Record one selector's match count, adding a diagnostic when it came up
    /// short.
    pub fn selector(&mut self, selector: &Selector, found: usize) -> &mut Self {
        let requested = usize::try_from(selector.quantity).unwrap_or(0);
        self.outcome.record_selector(found, requested);
        if found < requested {
            self.messages
                .push(StatusMessage::fewer_nodes(found, requested, selector));
        } else if found == 0 {
            self.messages.push(StatusMessage::no_match(selector));
        }
        self
    }

    pub fn geojson_error(&mut self, selector: &Selector) -> &mut Self {
        self.outcome.record_structural_error();
        self.messages.push(StatusMessage::geojson_error(selector));
        self
    }

    pub fn creation_failure(&mut self, kind: WorkloadKind, name: &str) -> &mut Self {
        self.outcome.record_workload_failure();
        self.messages.push(StatusMessage::CreationFailure {
            kind,
            name: name.to_string(),
        });
        self
    }

    pub fn in_use(&mut self, kind: WorkloadKind, name: &str) -> &mut Self {
        self.outcome.record_workload_failure();
        self.messages.push(StatusMessage::InUse {
            kind,
            name: name.to_string(),
        });
        self
    }

    /// Count workloads skipped because no node was selected.
    pub fn not_applied(&mut self, count: usize) -> &mut Self {
        for _ in 0..count {
            self.outcome.record_workload_failure();
        }
        self
    }

    /// Produce the next status, moving from `current` through the state machine.
    pub fn build(
        self,
        current: Option<DeploymentState>,
        generation: Option<i64>,
    ) -> SelectiveDeploymentStatus {
        let event = determine_event(&self.outcome);
        let state = DeploymentStateMachine::new()
            .transition(current, event)
            .target()
            .unwrap_or_else(|| event.target());

        let mut messages = self.messages;
        if state == DeploymentState::Success && messages.is_empty() {
            messages.push(StatusMessage::Success);
        }

        SelectiveDeploymentStatus {
            state,
            ready: format!("{}/{}", self.outcome.ready_workloads(), self.outcome.workloads),
            messages: messages.iter().map(ToString::to_string).collect(),
            fewer_nodes: self.outcome.fewer_nodes(),
            observed_generation: generation,
            last_updated: Some(jiff::Timestamp::now().to_string()),
        }
    }
}

/// Whether two statuses differ in anything but their timestamp.
pub fn status_changed(
    old: Option<&SelectiveDeploymentStatus>,
    new: &SelectiveDeploymentStatus,
) -> bool {
    match old {
        None => true,
        Some(old) => {
            old.state != new.state
                || old.ready != new.ready
                || old.messages != new.messages
                || old.fewer_nodes != new.fewer_nodes
                || old.observed_generation != new.observed_generation
        }
    }
}
