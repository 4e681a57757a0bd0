//! In-memory controller harness.
//!
//! Wires the real informers, monitors, queue and workers together, with a
//! recording [`Handler`] in place of the Kubernetes-backed reconciler. Watch
//! events are fed directly through [`Informer::handle_event`], so scenarios
//! run without a cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::Client;
use kube::runtime::watcher::Event;
use parking_lot::Mutex;

use selective_deployment_controller::Informers;
use selective_deployment_controller::controller::common::ObjectKey;
use selective_deployment_controller::controller::error::{Error, ErrorReporter, Result};
use selective_deployment_controller::controller::handler::Handler;
use selective_deployment_controller::controller::informer::ObjectStore;
use selective_deployment_controller::controller::queue::{QueueItem, WorkQueue};
use selective_deployment_controller::controller::sd_watch::Tombstones;
use selective_deployment_controller::controller::worker::Worker;
use selective_deployment_controller::crd::SelectiveDeployment;
use selective_deployment_controller::health::HealthState;

/// A handler call observed by [`RecordingHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Created(String),
    Updated(String),
    Deleted(String),
}

fn key_of(sd: &SelectiveDeployment) -> String {
    ObjectKey::from_resource(sd)
        .map(|key| key.to_string())
        .unwrap_or_default()
}

/// Handler that records its calls and answers node ownership from a table.
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<Call>>,
    owners: Mutex<HashMap<String, Vec<ObjectKey>>>,
}

impl RecordingHandler {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Declare `owners` as placed on `node`. Duplicates are kept as given.
    pub fn place(&self, node: &str, owners: &[&str]) {
        let keys = owners
            .iter()
            .map(|owner| ObjectKey::parse(owner).unwrap())
            .collect();
        self.owners.lock().insert(node.to_string(), keys);
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn init(&self, _client: &Client) -> Result<()> {
        Ok(())
    }

    async fn object_created(&self, sd: Arc<SelectiveDeployment>) {
        self.calls.lock().push(Call::Created(key_of(&sd)));
    }

    async fn object_updated(&self, sd: Arc<SelectiveDeployment>) {
        self.calls.lock().push(Call::Updated(key_of(&sd)));
    }

    async fn object_deleted(&self, sd: Arc<SelectiveDeployment>) {
        self.calls.lock().push(Call::Deleted(key_of(&sd)));
    }

    fn owners_by_node(&self, node: &str) -> Option<Vec<ObjectKey>> {
        self.owners.lock().get(node).cloned()
    }
}

/// Reporter that counts dropped items.
#[derive(Default)]
pub struct CountingReporter {
    pub reports: AtomicUsize,
}

impl ErrorReporter for CountingReporter {
    fn report(&self, _key: &str, _error: &Error) {
        self.reports.fetch_add(1, Ordering::SeqCst);
    }
}

/// Store whose lookups always fail.
#[derive(Default)]
pub struct BrokenStore {
    pub lookups: AtomicUsize,
}

impl ObjectStore<SelectiveDeployment> for BrokenStore {
    fn get_by_key(&self, _key: &str) -> Result<Option<Arc<SelectiveDeployment>>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Err(Error::Transient("cache unavailable".to_string()))
    }
}

pub struct Harness {
    pub informers: Informers,
    pub queue: Arc<WorkQueue>,
    pub tombstones: Arc<Tombstones>,
    pub handler: Arc<RecordingHandler>,
    pub reporter: Arc<CountingReporter>,
    pub health: Arc<HealthState>,
}

impl Harness {
    pub fn new() -> Self {
        let queue = Arc::new(WorkQueue::new());
        let tombstones = Arc::new(Tombstones::new());
        let handler = Arc::new(RecordingHandler::default());
        let health = Arc::new(HealthState::new());
        let mut informers = Informers::new();

        let dyn_handler: Arc<dyn Handler> = handler.clone();
        informers.wire(&queue, &tombstones, &dyn_handler, Some(health.clone()));

        Self {
            informers,
            queue,
            tombstones,
            handler,
            reporter: Arc::new(CountingReporter::default()),
            health,
        }
    }

    /// Deliver the initial list of every informer.
    pub fn sync(&mut self, deployments: Vec<SelectiveDeployment>, nodes: Vec<Node>) {
        let informers = &mut self.informers;
        informers.deployments.handle_event(Event::Init);
        for sd in deployments {
            informers.deployments.handle_event(Event::InitApply(sd));
        }
        informers.deployments.handle_event(Event::InitDone);

        informers.nodes.handle_event(Event::Init);
        for node in nodes {
            informers.nodes.handle_event(Event::InitApply(node));
        }
        informers.nodes.handle_event(Event::InitDone);

        informers.deployment_workloads.handle_event(Event::InitDone);
        informers.daemonsets.handle_event(Event::InitDone);
        informers.statefulsets.handle_event(Event::InitDone);
        informers.jobs.handle_event(Event::InitDone);
        informers.cronjobs.handle_event(Event::InitDone);
    }

    /// Sync, then discard the items the initial list produced.
    pub async fn settle(&mut self, deployments: Vec<SelectiveDeployment>, nodes: Vec<Node>) {
        self.sync(deployments, nodes);
        self.drain().await;
    }

    /// Pop and release every pending item, in order.
    pub async fn drain(&self) -> Vec<QueueItem> {
        let mut items = Vec::new();
        while !self.queue.is_empty() {
            let Some(item) = self.queue.pop().await else {
                break;
            };
            self.queue.done(&item);
            items.push(item);
        }
        items
    }

    /// Keys of the pending items, sorted.
    pub async fn drained_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.drain().await.into_iter().map(|item| item.key).collect();
        keys.sort();
        keys
    }

    /// A worker reading from the deployment cache.
    pub fn worker(&self) -> Worker {
        let store: Arc<dyn ObjectStore<SelectiveDeployment>> = self.informers.deployments.cache();
        self.worker_with_store(store)
    }

    pub fn worker_with_store(&self, store: Arc<dyn ObjectStore<SelectiveDeployment>>) -> Worker {
        let handler: Arc<dyn Handler> = self.handler.clone();
        let reporter: Arc<dyn ErrorReporter> = self.reporter.clone();
        Worker::new(
            0,
            self.queue.clone(),
            store,
            self.tombstones.clone(),
            handler,
            reporter,
        )
        .with_health(Some(self.health.clone()))
    }

    /// Process every pending item with one worker.
    pub async fn run_pending(&self) {
        let worker = self.worker();
        while !self.queue.is_empty() {
            let Some(item) = self.queue.pop().await else {
                break;
            };
            worker.process(&item).await;
        }
    }
}
