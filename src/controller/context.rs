//! Shared context for the reconciler.
//!
//! Holds the Kubernetes client and the event reporter identity used when
//! publishing events on SelectiveDeployments.

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::crd::SelectiveDeployment;
use crate::resources::common::FIELD_MANAGER;

/// Shared context for the reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
}

impl Context {
    /// Create a new context; `instance` identifies this replica in events.
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance,
            },
        }
    }

    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    async fn publish(
        &self,
        sd: &SelectiveDeployment,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let object_ref = sd.object_ref(&());
        if let Err(e) = self
            .recorder()
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a normal event for a SelectiveDeployment
    pub async fn publish_normal_event(
        &self,
        sd: &SelectiveDeployment,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(sd, EventType::Normal, reason, action, note).await;
    }

    /// Publish a warning event for a SelectiveDeployment
    pub async fn publish_warning_event(
        &self,
        sd: &SelectiveDeployment,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(sd, EventType::Warning, reason, action, note).await;
    }
}
