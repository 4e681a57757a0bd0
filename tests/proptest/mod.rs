// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for selective-deployment-controller.
//!
//! Uses proptest to generate random inputs and verify invariants.

#[path = "../common/mod.rs"]
mod common;

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;

use selective_deployment_controller::controller::queue::{Operation, QueueItem, WorkQueue};
use selective_deployment_controller::controller::selection::{CompiledSelector, point_in_polygon};
use selective_deployment_controller::controller::state_machine::{
    DeploymentStateMachine, ReconcileOutcome, StateEvent, determine_event,
};
use selective_deployment_controller::crd::DeploymentState;

use common::fixtures::{NodeBuilder, country};

fn any_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Create),
        Just(Operation::Update),
        Just(Operation::Delete),
    ]
}

fn any_state() -> impl Strategy<Value = Option<DeploymentState>> {
    prop_oneof![
        Just(None),
        Just(Some(DeploymentState::Success)),
        Just(Some(DeploymentState::Partial)),
        Just(Some(DeploymentState::Failure)),
    ]
}

fn any_event() -> impl Strategy<Value = StateEvent> {
    prop_oneof![
        Just(StateEvent::AllSelectorsSatisfied),
        Just(StateEvent::SelectorShortfall),
        Just(StateEvent::WorkloadsPartiallyFailed),
        Just(StateEvent::SelectorUnmatched),
        Just(StateEvent::StructuralError),
        Just(StateEvent::WorkloadsFailed),
    ]
}

fn any_outcome() -> impl Strategy<Value = ReconcileOutcome> {
    (0..3usize, 0..3usize, 0..2usize, 0..5usize, 0..6usize).prop_map(
        |(shortfalls, unmatched, structural_errors, workloads, failed)| ReconcileOutcome {
            shortfalls,
            unmatched,
            under_supplied: shortfalls,
            structural_errors,
            workloads,
            failed_workloads: failed.min(workloads),
        },
    )
}

fn severity(state: DeploymentState) -> u8 {
    match state {
        DeploymentState::Success => 0,
        DeploymentState::Partial => 1,
        DeploymentState::Failure => 2,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    /// A key is never pending twice, and the pending operation is the fold
    /// of every push.
    #[test]
    fn queue_collapses_pushes_per_key(
        pushes in prop::collection::vec((0..4usize, any_operation()), 1..40)
    ) {
        let queue = WorkQueue::new();
        let mut expected: HashMap<String, Operation> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (key, operation) in &pushes {
            let key = format!("ns1/sd{key}");
            queue.push(QueueItem::new(key.clone(), *operation));
            match expected.get_mut(&key) {
                Some(pending) => *pending = pending.merge(*operation),
                None => {
                    expected.insert(key.clone(), *operation);
                    order.push(key);
                }
            }
        }

        prop_assert_eq!(queue.len(), expected.len());
        let popped: Vec<QueueItem> = runtime().block_on(async {
            let mut items = Vec::new();
            while !queue.is_empty() {
                items.push(queue.pop().await.unwrap());
            }
            items
        });
        let popped_keys: Vec<String> = popped.iter().map(|item| item.key.clone()).collect();
        prop_assert_eq!(popped_keys, order);
        for item in popped {
            prop_assert_eq!(Some(&item.operation), expected.get(&item.key));
        }
    }

    /// A delete pushed last always wins.
    #[test]
    fn trailing_delete_wins(ops in prop::collection::vec(any_operation(), 0..10)) {
        let folded = ops
            .into_iter()
            .fold(None::<Operation>, |acc, op| Some(acc.map_or(op, |a| a.merge(op))));
        let merged = folded.map_or(Operation::Delete, |op| op.merge(Operation::Delete));
        prop_assert_eq!(merged, Operation::Delete);
    }

    /// A bounded selector never picks more than its quantity, and only ever
    /// picks matching nodes.
    #[test]
    fn selection_respects_quantity(
        countries in prop::collection::vec(prop_oneof![Just("FR"), Just("DE"), Just("US")], 0..20),
        quantity in 0..6i32,
    ) {
        let nodes: Vec<_> = countries
            .iter()
            .enumerate()
            .map(|(i, c)| NodeBuilder::new(format!("node-{i:02}")).country(c).build())
            .collect();
        let selector = country(&["FR"], quantity);
        let compiled = CompiledSelector::compile(&selector).unwrap();
        let selected = compiled.select(nodes.iter(), &BTreeSet::new());

        let matching = countries.iter().filter(|c| **c == "FR").count();
        if quantity > 0 {
            prop_assert_eq!(selected.len(), matching.min(quantity as usize));
        } else {
            prop_assert_eq!(selected.len(), matching);
        }
        let unique: BTreeSet<&String> = selected.iter().collect();
        prop_assert_eq!(unique.len(), selected.len());
    }

    /// Nodes from the current placement are kept ahead of new ones.
    #[test]
    fn selection_prefers_current_nodes(count in 1..10usize, keep in 0..10usize, quantity in 1..5i32) {
        let nodes: Vec<_> = (0..count)
            .map(|i| NodeBuilder::new(format!("node-{i:02}")).country("FR").build())
            .collect();
        let current: BTreeSet<String> = BTreeSet::from([format!("node-{:02}", keep % count)]);
        let selector = country(&["FR"], quantity);
        let selected = CompiledSelector::compile(&selector)
            .unwrap()
            .select(nodes.iter(), &current);

        prop_assert!(current.iter().all(|node| selected.contains(node)));
    }

    /// The centre of an axis-aligned rectangle is inside it, a point beyond its edge is not.
    #[test]
    fn point_inside_rectangle(
        lon in -179.0f64..179.0,
        lat in -89.0f64..89.0,
        width in 0.5f64..10.0,
        height in 0.5f64..10.0,
    ) {
        let rectangle = vec![
            (lon - width, lat - height),
            (lon + width, lat - height),
            (lon + width, lat + height),
            (lon - width, lat + height),
        ];
        prop_assert!(point_in_polygon(lon, lat, &rectangle));
        prop_assert!(!point_in_polygon(lon + 2.0 * width, lat, &rectangle));
    }

    /// Structural errors and unmatched selectors always fail; a clean
    /// outcome always succeeds.
    #[test]
    fn outcome_severity(outcome in any_outcome()) {
        let state = determine_event(&outcome).target();
        if outcome.structural_errors > 0 || outcome.unmatched > 0 {
            prop_assert_eq!(state, DeploymentState::Failure);
        } else if outcome.workloads > 0 && outcome.failed_workloads == outcome.workloads {
            prop_assert_eq!(state, DeploymentState::Failure);
        } else if outcome.shortfalls > 0 || outcome.failed_workloads > 0 {
            prop_assert_eq!(state, DeploymentState::Partial);
        } else {
            prop_assert_eq!(state, DeploymentState::Success);
        }
    }

    /// A selector that found fewer nodes than its quantity always sets the
    /// shortfall flag, and that flag never comes from an unbounded selector.
    #[test]
    fn fewer_nodes_tracks_quantity(
        selectors in prop::collection::vec((0..5usize, 0..5usize), 0..6)
    ) {
        let mut outcome = ReconcileOutcome::new(1);
        for (found, requested) in &selectors {
            outcome.record_selector(*found, *requested);
        }
        let short = selectors.iter().any(|(found, requested)| found < requested);
        prop_assert_eq!(outcome.fewer_nodes(), short);
        if outcome.fewer_nodes() {
            prop_assert!(severity(determine_event(&outcome).target()) >= 1);
        }
    }

    /// Every state accepts every event and lands on the event's target.
    #[test]
    fn transitions_are_total(state in any_state(), event in any_event()) {
        let fsm = DeploymentStateMachine::new();
        prop_assert_eq!(fsm.transition(state, event).target(), Some(event.target()));
    }
}
