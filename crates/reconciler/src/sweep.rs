//! Best-effort deletion of superseded Revisions.
//!
//! Failures are contained per Revision: the sweep only ends early when the
//! caller cancels it.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use revgc_ops::events::{actions, reasons};
use revgc_ops::{DeleteOutcome, EventPublisher, RevisionOps};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::decision::{Candidate, Plan};
use crate::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub deleted: Vec<String>,
    /// Deleted concurrently by someone else before our request landed.
    pub already_gone: Vec<String>,
    /// `(revision, error)` for deletes the API server refused.
    pub failed: Vec<(String, String)>,
}

impl SweepReport {
    fn record(mut self, name: &str, res: anyhow::Result<DeleteOutcome>) -> Self {
        match res {
            Ok(DeleteOutcome::Deleted) => self.deleted.push(name.to_string()),
            Ok(DeleteOutcome::NotFound) => self.already_gone.push(name.to_string()),
            Err(e) => self.failed.push((name.to_string(), e.to_string())),
        }
        self
    }
}

pub(crate) async fn sweep(
    ops: &dyn RevisionOps,
    events: &dyn EventPublisher,
    cancel: &CancellationToken,
    service_ref: &ObjectReference,
    plan: &Plan,
) -> Result<SweepReport, Error> {
    let mut report = SweepReport::default();
    for Candidate { name, generation } in &plan.superseded {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = ops.delete_revision(&plan.namespace, name) => r,
        };
        match &res {
            Ok(DeleteOutcome::Deleted) => {
                metrics::counter!("revgc_revisions_deleted_total", 1u64);
                debug!(ns = %plan.namespace, service = %plan.service, revision = %name, generation = %generation, "deleted superseded revision");
            }
            Ok(DeleteOutcome::NotFound) => {}
            Err(e) => {
                metrics::counter!("revgc_revision_delete_failures_total", 1u64);
                error!(ns = %plan.namespace, service = %plan.service, revision = %name, error = %e, "delete revision failed");
                events
                    .publish(
                        service_ref,
                        EventType::Warning,
                        reasons::REVISION_DELETE_FAILED,
                        actions::DELETE,
                        Some(format!("deleting revision {}: {}", name, e)),
                    )
                    .await;
            }
        }
        report = report.record(name, res);
    }
    Ok(report)
}
