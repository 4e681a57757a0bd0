//! Finite state machine for the SelectiveDeployment status.
//!
//! `status.state` is always derived from what one reconciliation observed:
//! how the selectors matched and whether the workloads could be applied.
//! The observations are folded into a [`ReconcileOutcome`], mapped to a
//! [`StateEvent`] by [`determine_event`], and the event is checked against an
//! explicit transition table. A resource without status starts in `None`.

use std::fmt;

use crate::crd::DeploymentState;

/// Events that move a SelectiveDeployment between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    /// Every selector found its requested nodes and every workload applied
    AllSelectorsSatisfied,
    /// A selector found fewer nodes than its quantity
    SelectorShortfall,
    /// Some, but not all, workloads could not be applied
    WorkloadsPartiallyFailed,
    /// A selector matched no node at all
    SelectorUnmatched,
    /// The selection criteria are malformed
    StructuralError,
    /// No workload could be applied
    WorkloadsFailed,
}

impl StateEvent {
    /// State every transition triggered by this event leads to.
    pub const fn target(self) -> DeploymentState {
        match self {
            StateEvent::AllSelectorsSatisfied => DeploymentState::Success,
            StateEvent::SelectorShortfall | StateEvent::WorkloadsPartiallyFailed => {
                DeploymentState::Partial
            }
            StateEvent::SelectorUnmatched
            | StateEvent::StructuralError
            | StateEvent::WorkloadsFailed => DeploymentState::Failure,
        }
    }
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateEvent::AllSelectorsSatisfied => write!(f, "AllSelectorsSatisfied"),
            StateEvent::SelectorShortfall => write!(f, "SelectorShortfall"),
            StateEvent::WorkloadsPartiallyFailed => write!(f, "WorkloadsPartiallyFailed"),
            StateEvent::SelectorUnmatched => write!(f, "SelectorUnmatched"),
            StateEvent::StructuralError => write!(f, "StructuralError"),
            StateEvent::WorkloadsFailed => write!(f, "WorkloadsFailed"),
        }
    }
}

/// What one reconciliation observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Selectors that matched fewer nodes than requested, but at least one
    pub shortfalls: usize,
    /// Selectors that matched no node
    pub unmatched: usize,
    /// Selectors that found fewer nodes than a non-zero quantity, matched or not
    pub under_supplied: usize,
    /// Selectors whose criteria could not be evaluated
    pub structural_errors: usize,
    /// Workloads the resource asks for
    pub workloads: usize,
    /// Workloads that could not be applied (including ones owned elsewhere)
    pub failed_workloads: usize,
}

impl ReconcileOutcome {
    pub fn new(workloads: usize) -> Self {
        Self {
            workloads,
            ..Default::default()
        }
    }

    /// Count the result of evaluating one selector.
    pub fn record_selector(&mut self, found: usize, requested: usize) {
        if found < requested {
            self.under_supplied += 1;
        }
        if found == 0 {
            self.unmatched += 1;
        } else if found < requested {
            self.shortfalls += 1;
        }
    }

    pub fn record_structural_error(&mut self) {
        self.structural_errors += 1;
    }

    pub fn record_workload_failure(&mut self) {
        self.failed_workloads += 1;
    }

    /// Workloads applied successfully.
    pub fn ready_workloads(&self) -> usize {
        self.workloads.saturating_sub(self.failed_workloads)
    }

    /// Whether any selector came up short of its quantity, including one
    /// that matched nothing.
    pub fn fewer_nodes(&self) -> bool {
        self.under_supplied > 0
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    /// Source state, `None` for a resource without status
    pub from: Option<DeploymentState>,
    /// Target state
    pub to: DeploymentState,
    /// Event that triggers this transition
    pub event: StateEvent,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: Option<DeploymentState>,
        to: DeploymentState,
        event: StateEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    /// Transition was successful
    Success {
        from: Option<DeploymentState>,
        to: DeploymentState,
        event: StateEvent,
        description: &'static str,
    },
    /// Transition was not valid for current state
    InvalidTransition {
        current: Option<DeploymentState>,
        event: StateEvent,
    },
}

impl TransitionResult {
    /// State after the transition, or `None` if it was rejected.
    pub fn target(&self) -> Option<DeploymentState> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            TransitionResult::InvalidTransition { .. } => None,
        }
    }
}

/// Transition table for `status.state`
pub struct DeploymentStateMachine {
    transitions: Vec<Transition>,
}

impl Default for DeploymentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentStateMachine {
    pub fn new() -> Self {
        use DeploymentState::{Failure, Partial, Success};
        use StateEvent::*;

        let mut transitions = Vec::new();
        for from in [None, Some(Success), Some(Partial), Some(Failure)] {
            transitions.extend([
                Transition::new(from, Success, AllSelectorsSatisfied, "Workloads placed on every requested node"),
                Transition::new(from, Partial, SelectorShortfall, "Fewer nodes found than requested"),
                Transition::new(from, Partial, WorkloadsPartiallyFailed, "Some workloads could not be applied"),
                Transition::new(from, Failure, SelectorUnmatched, "A selector matched no node"),
                Transition::new(from, Failure, StructuralError, "Selection criteria are malformed"),
                Transition::new(from, Failure, WorkloadsFailed, "No workload could be applied"),
            ]);
        }
        Self { transitions }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(&self, current: Option<DeploymentState>, event: StateEvent) -> TransitionResult {
        match self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event)
        {
            Some(t) => TransitionResult::Success {
                from: t.from,
                to: t.to,
                event,
                description: t.description,
            },
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

}

/// Determine the event for a reconciliation outcome.
///
/// The most severe observation wins: Failure over Partial over Success.
pub fn determine_event(outcome: &ReconcileOutcome) -> StateEvent {
    if outcome.structural_errors > 0 {
        StateEvent::StructuralError
    } else if outcome.unmatched > 0 {
        StateEvent::SelectorUnmatched
    } else if outcome.workloads > 0 && outcome.failed_workloads >= outcome.workloads {
        StateEvent::WorkloadsFailed
    } else if outcome.shortfalls > 0 {
        StateEvent::SelectorShortfall
    } else if outcome.failed_workloads > 0 {
        StateEvent::WorkloadsPartiallyFailed
    } else {
        StateEvent::AllSelectorsSatisfied
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_transition() {
        let sm = DeploymentStateMachine::new();
        match sm.transition(None, StateEvent::AllSelectorsSatisfied) {
            TransitionResult::Success { from, to, .. } => {
                assert_eq!(from, None);
                assert_eq!(to, DeploymentState::Success);
            }
            other => panic!("Expected successful transition, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_transitions() {
        let sm = DeploymentStateMachine::new();
        let recovered = sm.transition(Some(DeploymentState::Failure), StateEvent::AllSelectorsSatisfied);
        assert_eq!(recovered.target(), Some(DeploymentState::Success));
        let recovered = sm.transition(Some(DeploymentState::Partial), StateEvent::AllSelectorsSatisfied);
        assert_eq!(recovered.target(), Some(DeploymentState::Success));
        let degraded = sm.transition(Some(DeploymentState::Success), StateEvent::SelectorShortfall);
        assert_eq!(degraded.target(), Some(DeploymentState::Partial));
    }

    #[test]
    fn test_determine_event_success() {
        let outcome = ReconcileOutcome::new(2);
        assert_eq!(determine_event(&outcome), StateEvent::AllSelectorsSatisfied);
    }

    #[test]
    fn test_determine_event_shortfall() {
        let mut outcome = ReconcileOutcome::new(1);
        outcome.record_selector(2, 3);
        outcome.record_selector(3, 3);
        assert!(outcome.fewer_nodes());
        assert_eq!(determine_event(&outcome), StateEvent::SelectorShortfall);
    }

    #[test]
    fn test_determine_event_failure_beats_partial() {
        let mut outcome = ReconcileOutcome::new(1);
        outcome.record_selector(2, 3);
        outcome.record_selector(0, 1);
        assert_eq!(determine_event(&outcome), StateEvent::SelectorUnmatched);

        outcome.record_structural_error();
        assert_eq!(determine_event(&outcome), StateEvent::StructuralError);
    }

    #[test]
    fn test_determine_event_workloads() {
        let mut outcome = ReconcileOutcome::new(2);
        outcome.record_workload_failure();
        assert_eq!(determine_event(&outcome), StateEvent::WorkloadsPartiallyFailed);
        assert_eq!(outcome.ready_workloads(), 1);

        outcome.record_workload_failure();
        assert_eq!(determine_event(&outcome), StateEvent::WorkloadsFailed);
        assert_eq!(outcome.ready_workloads(), 0);
    }

    #[test]
    fn test_quantity_zero_only_fails_when_unmatched() {
        let mut outcome = ReconcileOutcome::new(1);
        // quantity 0 means "all matching nodes": any match satisfies it
        outcome.record_selector(4, 0);
        assert_eq!(determine_event(&outcome), StateEvent::AllSelectorsSatisfied);
    }

    #[test]
    fn test_unmatched_bounded_selector_is_under_supplied() {
        let mut outcome = ReconcileOutcome::new(1);
        outcome.record_selector(0, 3);
        assert!(outcome.fewer_nodes());
        assert_eq!(determine_event(&outcome), StateEvent::SelectorUnmatched);
    }

    #[test]
    fn test_unmatched_open_selector_is_not_under_supplied() {
        let mut outcome = ReconcileOutcome::new(1);
        outcome.record_selector(0, 0);
        assert!(!outcome.fewer_nodes());
        assert_eq!(determine_event(&outcome), StateEvent::SelectorUnmatched);
    }
}
