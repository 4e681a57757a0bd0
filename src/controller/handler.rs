//! Contract between the worker loop and the reconciliation logic.

use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;

use crate::controller::common::ObjectKey;
use crate::controller::error::Result;
use crate::crd::SelectiveDeployment;

/// Reconciles SelectiveDeployments dispatched by the workers.
///
/// The object callbacks absorb their own failures: problems surface in the
/// resource status, which feeds the next recovery decision, not as errors
/// returned to the worker.
#[async_trait]
pub trait Handler: Send + Sync {
    /// One-time setup, called before any watch loop starts. An error aborts
    /// the controller.
    async fn init(&self, client: &Client) -> Result<()>;

    /// A SelectiveDeployment was observed for the first time.
    async fn object_created(&self, sd: Arc<SelectiveDeployment>);

    /// A SelectiveDeployment needs to be reconciled again.
    async fn object_updated(&self, sd: Arc<SelectiveDeployment>);

    /// A SelectiveDeployment is gone; `sd` is its last known state.
    async fn object_deleted(&self, sd: Arc<SelectiveDeployment>);

    /// SelectiveDeployments whose last placement included `node`.
    ///
    /// Called from watch callbacks, so it must only read local state.
    fn owners_by_node(&self, node: &str) -> Option<Vec<ObjectKey>>;
}
