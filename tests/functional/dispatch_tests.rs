//! Queue and worker scenarios: deduplication, delete handling and retries.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use kube::runtime::watcher::Event;
use selective_deployment_controller::controller::queue::{Operation, QueueItem};
use selective_deployment_controller::controller::worker::MAX_RETRIES;
use selective_deployment_controller::crd::{DeploymentState, SelectiveDeploymentStatus};

use crate::common::fixtures::{NodeBuilder, SelectiveDeploymentBuilder, country};
use crate::harness::{BrokenStore, Call, Harness};

fn web() -> SelectiveDeploymentBuilder {
    SelectiveDeploymentBuilder::new("web")
        .recovery(true)
        .deployment("web")
        .selector(country(&["FR"], 0))
}

#[tokio::test]
async fn test_create_dispatches_created() {
    let mut harness = Harness::new();
    harness.sync(vec![web().build()], vec![]);
    harness.run_pending().await;

    assert_eq!(harness.handler.calls(), vec![Call::Created("ns1/web".to_string())]);
}

#[tokio::test]
async fn test_burst_collapses_to_one_item() {
    let mut harness = Harness::new();
    harness
        .settle(vec![web().state(DeploymentState::Failure).build()], vec![])
        .await;

    for i in 0..10 {
        harness.informers.nodes.handle_event(Event::Apply(
            NodeBuilder::new(format!("fr-{i}")).country("FR").build(),
        ));
    }
    harness.informers.deployments.handle_event(Event::Apply(
        web()
            .state(DeploymentState::Failure)
            .generation(2)
            .resource_version("2")
            .build(),
    ));

    assert_eq!(harness.drain().await, vec![QueueItem::update("ns1/web")]);
}

#[tokio::test]
async fn test_status_write_does_not_requeue() {
    let mut harness = Harness::new();
    harness.settle(vec![web().build()], vec![]).await;

    let mut written = web().resource_version("2").build();
    written.status = Some(SelectiveDeploymentStatus {
        state: DeploymentState::Success,
        ready: "1/1".to_string(),
        ..Default::default()
    });
    harness
        .informers
        .deployments
        .handle_event(Event::Apply(written));

    assert!(harness.drain().await.is_empty());
}

#[tokio::test]
async fn test_delete_dispatches_last_known_state() {
    let mut harness = Harness::new();
    harness.settle(vec![web().build()], vec![]).await;

    harness
        .informers
        .deployments
        .handle_event(Event::Delete(web().build()));
    assert_eq!(harness.tombstones.len(), 1);
    harness.run_pending().await;

    assert_eq!(harness.handler.calls(), vec![Call::Deleted("ns1/web".to_string())]);
    assert!(harness.tombstones.is_empty());
}

#[tokio::test]
async fn test_update_then_delete_only_deletes() {
    let mut harness = Harness::new();
    harness.settle(vec![web().build()], vec![]).await;

    harness.informers.deployments.handle_event(Event::Apply(
        web().generation(2).resource_version("2").build(),
    ));
    harness
        .informers
        .deployments
        .handle_event(Event::Delete(web().build()));
    harness.run_pending().await;

    assert_eq!(harness.handler.calls(), vec![Call::Deleted("ns1/web".to_string())]);
}

#[tokio::test]
async fn test_recreated_object_skips_stale_delete() {
    let mut harness = Harness::new();
    harness.settle(vec![web().build()], vec![]).await;

    harness
        .informers
        .deployments
        .handle_event(Event::Delete(web().build()));
    harness
        .informers
        .deployments
        .handle_event(Event::Apply(web().uid(Some("uid-2")).build()));

    let items = harness.drain().await;
    assert_eq!(items, vec![QueueItem::create("ns1/web")]);
    assert!(harness.tombstones.is_empty());
}

#[tokio::test]
async fn test_update_for_missing_object_is_skipped() {
    let mut harness = Harness::new();
    harness.settle(vec![], vec![]).await;

    harness.queue.push(QueueItem::update("ns1/ghost"));
    harness.run_pending().await;

    assert!(harness.handler.calls().is_empty());
    assert_eq!(harness.reporter.reports.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_item_is_dropped_after_retries() {
    let harness = Harness::new();
    let store = Arc::new(BrokenStore::default());
    let worker = harness.worker_with_store(store.clone());

    harness.queue.push(QueueItem::create("ns1/web"));
    for _ in 0..=MAX_RETRIES {
        let item = harness.queue.pop().await.unwrap();
        assert_eq!(item.operation, Operation::Create);
        worker.process(&item).await;
    }

    assert_eq!(store.lookups.load(Ordering::SeqCst), MAX_RETRIES as usize + 1);
    assert_eq!(harness.reporter.reports.load(Ordering::SeqCst), 1);
    assert_eq!(harness.queue.num_requeues("ns1/web"), 0);
    assert!(harness.queue.is_empty());
    assert!(harness.handler.calls().is_empty());

    let metrics = harness.health.metrics.encode();
    assert!(metrics.contains("sdcontroller_dropped_items_total 1"));
}
