//! selective-deployment-controller library crate
//!
//! This module exports the controller pipeline, CRD definitions, and resource
//! generators, and wires them together in [`run_controller`].

pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::ControllerConfig;
pub use health::HealthState;

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use controller::context::Context;
use controller::error::{ErrorReporter, LogReporter, Result};
use controller::handler::Handler;
use controller::informer::{Cache, Informer, ObjectStore, wait_for_cache_sync};
use controller::node_monitor::NodeMonitor;
use controller::ownership::OwnershipIndex;
use controller::queue::WorkQueue;
use controller::reconciler::SelectiveDeploymentReconciler;
use controller::sd_watch::{DeploymentWatch, Tombstones};
use controller::worker::Worker;
use controller::workload_monitor::WorkloadMonitor;
use crd::SelectiveDeployment;
use resources::Workload;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Watcher configuration shared by every informer.
///
/// `any_semantic()` lets the initial list be served from the API server cache.
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// The seven informers feeding the work queue.
pub struct Informers {
    pub deployments: Informer<SelectiveDeployment>,
    pub nodes: Informer<Node>,
    pub deployment_workloads: Informer<Deployment>,
    pub daemonsets: Informer<DaemonSet>,
    pub statefulsets: Informer<StatefulSet>,
    pub jobs: Informer<Job>,
    pub cronjobs: Informer<CronJob>,
}

impl Default for Informers {
    fn default() -> Self {
        Self::new()
    }
}

impl Informers {
    pub fn new() -> Self {
        Self {
            deployments: Informer::new(),
            nodes: Informer::new(),
            deployment_workloads: Informer::new(),
            daemonsets: Informer::new(),
            statefulsets: Informer::new(),
            jobs: Informer::new(),
            cronjobs: Informer::new(),
        }
    }

    /// Register the queue-feeding callbacks on every informer.
    pub fn wire(
        &mut self,
        queue: &Arc<WorkQueue>,
        tombstones: &Arc<Tombstones>,
        handler: &Arc<dyn Handler>,
        health: Option<Arc<HealthState>>,
    ) {
        let deployments = self.deployments.cache();
        self.deployments.add_event_handler(Arc::new(DeploymentWatch::new(
            Arc::clone(queue),
            Arc::clone(tombstones),
        )));
        self.nodes.add_event_handler(Arc::new(NodeMonitor::new(
            Arc::clone(&deployments),
            Arc::clone(handler),
            Arc::clone(queue),
            health,
        )));
        watch_workloads(&mut self.deployment_workloads, &deployments, queue);
        watch_workloads(&mut self.daemonsets, &deployments, queue);
        watch_workloads(&mut self.statefulsets, &deployments, queue);
        watch_workloads(&mut self.jobs, &deployments, queue);
        watch_workloads(&mut self.cronjobs, &deployments, queue);
    }

    /// Futures resolving once each informer completed its initial list.
    pub fn sync_futures(&self) -> Vec<(&'static str, BoxFuture<'static, ()>)> {
        vec![
            ("SelectiveDeployment", synced(self.deployments.cache())),
            ("Node", synced(self.nodes.cache())),
            ("Deployment", synced(self.deployment_workloads.cache())),
            ("DaemonSet", synced(self.daemonsets.cache())),
            ("StatefulSet", synced(self.statefulsets.cache())),
            ("Job", synced(self.jobs.cache())),
            ("CronJob", synced(self.cronjobs.cache())),
        ]
    }

    /// Start one list/watch task per informer.
    pub fn spawn(
        self,
        client: &Client,
        namespace: Option<&str>,
        token: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let config = default_watcher_config();
        vec![
            tokio::spawn(self.deployments.run(
                scoped_api(client.clone(), namespace),
                config.clone(),
                token.clone(),
            )),
            tokio::spawn(
                self.nodes
                    .run(Api::all(client.clone()), config.clone(), token.clone()),
            ),
            tokio::spawn(self.deployment_workloads.run(
                scoped_api(client.clone(), namespace),
                config.clone(),
                token.clone(),
            )),
            tokio::spawn(self.daemonsets.run(
                scoped_api(client.clone(), namespace),
                config.clone(),
                token.clone(),
            )),
            tokio::spawn(self.statefulsets.run(
                scoped_api(client.clone(), namespace),
                config.clone(),
                token.clone(),
            )),
            tokio::spawn(self.jobs.run(
                scoped_api(client.clone(), namespace),
                config.clone(),
                token.clone(),
            )),
            tokio::spawn(self.cronjobs.run(
                scoped_api(client.clone(), namespace),
                config,
                token.clone(),
            )),
        ]
    }
}

fn watch_workloads<W: Workload>(
    informer: &mut Informer<W>,
    deployments: &Arc<Cache<SelectiveDeployment>>,
    queue: &Arc<WorkQueue>,
) {
    informer.add_event_handler(Arc::new(WorkloadMonitor::<W>::new(
        Arc::clone(deployments),
        Arc::clone(queue),
    )));
}

fn synced<K: Send + Sync + 'static>(cache: Arc<Cache<K>>) -> BoxFuture<'static, ()> {
    async move { cache.wait_synced().await }.boxed()
}

/// Run the controller until `token` is cancelled.
///
/// The handler is initialised before any watch starts. Workers only start
/// once every cache has synced; failing to sync within the configured timeout
/// is fatal. On cancellation the watches stop, the queue is closed and
/// workers exit after their current item.
pub async fn run_controller(
    client: Client,
    config: &ControllerConfig,
    health_state: Option<Arc<HealthState>>,
    token: CancellationToken,
) -> Result<()> {
    let namespace = config.watch_namespace.as_deref();
    info!(
        scope = namespace.unwrap_or("cluster-wide"),
        workers = config.worker_count(),
        "Starting SelectiveDeployment controller"
    );

    let queue = Arc::new(WorkQueue::new());
    let tombstones = Arc::new(Tombstones::new());
    let mut informers = Informers::new();

    let ctx = Context::new(client.clone(), Some(config.holder_id()));
    let handler: Arc<dyn Handler> = Arc::new(SelectiveDeploymentReconciler::new(
        ctx,
        informers.nodes.cache(),
        Arc::new(OwnershipIndex::new()),
    ));
    handler.init(&client).await?;

    informers.wire(&queue, &tombstones, &handler, health_state.clone());
    let syncs = informers.sync_futures();
    let store: Arc<dyn ObjectStore<SelectiveDeployment>> = informers.deployments.cache();
    let watches = informers.spawn(&client, namespace, &token);

    if let Err(e) = wait_for_cache_sync(syncs, config.cache_sync_timeout(), &token).await {
        error!(error = %e, "Caches failed to sync");
        token.cancel();
        queue.shutdown();
        return Err(e);
    }
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let reporter: Arc<dyn ErrorReporter> = Arc::new(LogReporter);
    let workers: Vec<JoinHandle<()>> = (0..config.worker_count())
        .map(|id| {
            let worker = Worker::new(
                id,
                Arc::clone(&queue),
                Arc::clone(&store),
                Arc::clone(&tombstones),
                Arc::clone(&handler),
                Arc::clone(&reporter),
            )
            .with_health(health_state.clone());
            tokio::spawn(worker.run())
        })
        .collect();

    token.cancelled().await;
    info!("Shutting down controller");
    queue.shutdown();
    for handle in workers.into_iter().chain(watches) {
        if let Err(e) = handle.await {
            error!(error = %e, "Controller task panicked");
        }
    }
    info!("Controller stopped");
    Ok(())
}
