//! revgc ops: imperative Kubernetes operations the collector performs.
//!
//! The only write is a Revision delete. Event publishing lives in [`events`].

#![forbid(unsafe_code)]

use anyhow::Result;
use kube::{api::{Api, DeleteParams}, Client};
use revgc_core::Revision;
use tracing::{debug, info};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

pub mod events;

pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
#[cfg(any(test, feature = "mock"))]
pub use events::MockEventPublisher;

/// Result of a delete that reached the API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Already gone (HTTP 404).
    NotFound,
}

/// Write model for Revisions.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait::async_trait]
pub trait RevisionOps: Send + Sync {
    async fn delete_revision(&self, namespace: &str, name: &str) -> Result<DeleteOutcome>;
}

/// Kube-backed implementation.
#[derive(Clone)]
pub struct KubeOps {
    client: Client,
}

impl KubeOps {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl RevisionOps for KubeOps {
    async fn delete_revision(&self, namespace: &str, name: &str) -> Result<DeleteOutcome> {
        let api: Api<Revision> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(ns = %namespace, revision = %name, "revision delete requested");
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) if is_not_found(&e) => {
                debug!(ns = %namespace, revision = %name, "revision already gone");
                Ok(DeleteOutcome::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// True for API responses carrying HTTP 404.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
