//! Kubernetes Event recording.
//!
//! Events are fire-and-forget: failures are logged and never propagate, so a
//! broken event sink can never fail a reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

/// Reporting component used when none is configured.
pub const DEFAULT_CONTROLLER_NAME: &str = "serving-controller";

#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter { controller: controller_name.to_string(), instance: None };
        Self { client, reporter }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), resource_ref.clone());
        let event = Event { type_, reason: reason.to_string(), note, action: action.to_string(), secondary: None };
        if let Err(e) = recorder.publish(event).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Discards every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Values for the REASON column of `kubectl get events`.
pub mod reasons {
    /// Reconciliation failed and will be retried.
    pub const INTERNAL_ERROR: &str = "InternalError";
    /// A superseded Revision could not be deleted.
    pub const REVISION_DELETE_FAILED: &str = "RevisionDeleteFailed";
}

/// Values for the ACTION column of `kubectl get events`.
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<KubeEventPublisher>();
    }

    #[tokio::test]
    async fn noop_publisher_accepts_events() {
        NoopEventPublisher
            .publish(&ObjectReference::default(), EventType::Warning, reasons::INTERNAL_ERROR, actions::RECONCILE, None)
            .await;
    }
}
