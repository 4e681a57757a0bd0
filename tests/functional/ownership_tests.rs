//! Placement disruption and workload ownership scenarios.

use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher::Event;
use selective_deployment_controller::controller::queue::{Operation, QueueItem};
use selective_deployment_controller::crd::{DeploymentState, SelectiveDeployment};

use crate::common::fixtures::{NodeBuilder, SelectiveDeploymentBuilder, country, owned_deployment};
use crate::harness::Harness;

fn deployments() -> Vec<SelectiveDeployment> {
    vec![
        SelectiveDeploymentBuilder::new("web")
            .recovery(true)
            .deployment("web")
            .selector(country(&["FR"], 1))
            .state(DeploymentState::Success)
            .build(),
        SelectiveDeploymentBuilder::new("batch")
            .deployment("batch")
            .selector(country(&["FR"], 1))
            .state(DeploymentState::Success)
            .build(),
    ]
}

fn fr_node() -> NodeBuilder {
    NodeBuilder::new("fr-1").country("FR")
}

#[tokio::test]
async fn test_unready_node_enqueues_owner_once() {
    let mut harness = Harness::new();
    harness.settle(deployments(), vec![fr_node().build()]).await;
    harness
        .handler
        .place("fr-1", &["ns1/web", "ns1/web", "ns1/batch", "ns1/missing"]);

    harness.informers.nodes.handle_event(Event::Apply(
        fr_node().ready(Some("False")).resource_version("2").build(),
    ));

    assert_eq!(harness.drain().await, vec![QueueItem::update("ns1/web")]);
}

#[tokio::test]
async fn test_cordon_enqueues_owner() {
    let mut harness = Harness::new();
    harness.settle(deployments(), vec![fr_node().build()]).await;
    harness.handler.place("fr-1", &["ns1/web"]);

    harness.informers.nodes.handle_event(Event::Apply(
        fr_node().unschedulable(true).resource_version("2").build(),
    ));

    assert_eq!(harness.drain().await, vec![QueueItem::update("ns1/web")]);
}

#[tokio::test]
async fn test_address_change_enqueues_owner() {
    let mut harness = Harness::new();
    harness.settle(deployments(), vec![fr_node().build()]).await;
    harness.handler.place("fr-1", &["ns1/web"]);

    harness.informers.nodes.handle_event(Event::Apply(
        fr_node().address("10.0.0.99").resource_version("2").build(),
    ));

    assert_eq!(harness.drain().await, vec![QueueItem::update("ns1/web")]);
}

#[tokio::test]
async fn test_node_deleted_enqueues_owner() {
    let mut harness = Harness::new();
    harness.settle(deployments(), vec![fr_node().build()]).await;
    harness.handler.place("fr-1", &["ns1/web", "ns1/batch"]);

    harness
        .informers
        .nodes
        .handle_event(Event::Delete(fr_node().build()));

    assert_eq!(harness.drain().await, vec![QueueItem::update("ns1/web")]);
}

#[tokio::test]
async fn test_node_without_placements_is_ignored() {
    let mut harness = Harness::new();
    harness.settle(deployments(), vec![fr_node().build()]).await;

    harness
        .informers
        .nodes
        .handle_event(Event::Delete(fr_node().build()));

    assert!(harness.drain().await.is_empty());
}

#[tokio::test]
async fn test_orphan_workload_is_adopted() {
    let mut harness = Harness::new();
    harness.settle(deployments(), vec![]).await;

    harness
        .informers
        .deployment_workloads
        .handle_event(Event::Apply(owned_deployment("web", &[])));

    assert_eq!(harness.drain().await, vec![QueueItem::update("ns1/web")]);
}

#[tokio::test]
async fn test_dangling_owner_falls_back_to_name() {
    let mut harness = Harness::new();
    harness.settle(deployments(), vec![]).await;

    harness
        .informers
        .deployment_workloads
        .handle_event(Event::Apply(owned_deployment("batch", &["gone"])));

    assert_eq!(harness.drain().await, vec![QueueItem::update("ns1/batch")]);
}

#[tokio::test]
async fn test_controlled_workload_is_left_alone() {
    let mut harness = Harness::new();
    harness.settle(deployments(), vec![]).await;

    harness
        .informers
        .deployment_workloads
        .handle_event(Event::Apply(owned_deployment("web", &["web"])));
    harness
        .informers
        .deployment_workloads
        .handle_event(Event::Apply(owned_deployment("unrelated", &[])));

    assert!(harness.drain().await.is_empty());
}

#[tokio::test]
async fn test_workload_update_is_ignored() {
    let mut harness = Harness::new();
    harness.settle(deployments(), vec![]).await;
    let informer = &mut harness.informers.deployment_workloads;
    informer.handle_event(Event::Apply(owned_deployment("web", &["web"])));

    let mut updated: Deployment = owned_deployment("web", &[]);
    updated.metadata.resource_version = Some("2".to_string());
    informer.handle_event(Event::Apply(updated));

    assert!(harness.drain().await.is_empty());
}

#[tokio::test]
async fn test_deleted_workload_enqueues_live_owners() {
    let mut harness = Harness::new();
    harness.settle(deployments(), vec![]).await;

    harness
        .informers
        .deployment_workloads
        .handle_event(Event::Delete(owned_deployment("web", &["web", "gone", "web"])));

    let items = harness.drain().await;
    assert_eq!(items, vec![QueueItem::update("ns1/web")]);
    assert_eq!(items[0].operation, Operation::Update);
}
