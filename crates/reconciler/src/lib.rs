//! revgc reconciler: garbage-collects superseded Revisions of a Service.
//!
//! Given a Service key, the reconciler reads the Service's Route from the
//! cache and, when all traffic follows the latest Revision, deletes every
//! sibling Revision stamped from an older Configuration generation.
//!
//! Outcomes fall into two classes:
//! - structural no-ops (missing Route, traffic not ready, split or pinned
//!   traffic): `Ok`, nothing to retry until the world changes;
//! - lookup and label failures on objects expected to exist: `Err`, plus a
//!   Warning event on the Service, so the dispatcher retries with backoff.
//!
//! Per-Revision delete failures never fail the reconciliation.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kube::runtime::events::EventType;
use kube::Resource;
use revgc_core::{split_key, GenerationError, LookupError, ReadModel, Service};
use revgc_ops::events::{actions, reasons};
use revgc_ops::{EventPublisher, RevisionOps};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod decision;
pub mod sweep;

pub use decision::{plan, Candidate, Decision, NoOpReason, Plan, Unreadable};
pub use sweep::SweepReport;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("revision {revision}: {source}")]
    Generation {
        revision: String,
        #[source]
        source: GenerationError,
    },
    #[error("route {route} follows the latest revision but names none")]
    MissingRevisionName { route: String },
    #[error("reconciliation cancelled")]
    Cancelled,
}

/// What a successful reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    InvalidKey,
    ServiceGone,
    ServiceDeleting,
    NoOp(NoOpReason),
    Swept { plan: Plan, report: SweepReport },
}

impl Outcome {
    fn metric_label(&self) -> &'static str {
        match self {
            Outcome::Swept { .. } => "swept",
            _ => "noop",
        }
    }
}

/// Decision engine with injected read, write and event collaborators.
#[derive(Clone)]
pub struct Reconciler {
    read: Arc<dyn ReadModel>,
    ops: Arc<dyn RevisionOps>,
    events: Arc<dyn EventPublisher>,
}

impl Reconciler {
    pub fn new(read: Arc<dyn ReadModel>, ops: Arc<dyn RevisionOps>, events: Arc<dyn EventPublisher>) -> Self {
        Self { read, ops, events }
    }

    /// Reconcile the Service behind a `namespace/name` key.
    ///
    /// `Err` asks the dispatcher to retry; every other situation is `Ok`.
    pub async fn reconcile(&self, cancel: &CancellationToken, key: &str) -> Result<Outcome, Error> {
        let t0 = Instant::now();
        let res = self.reconcile_key(cancel, key).await;
        metrics::histogram!("revgc_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let outcome = match &res {
            Ok(o) => o.metric_label(),
            Err(_) => "error",
        };
        metrics::counter!("revgc_reconcile_total", 1u64, "outcome" => outcome);
        res
    }

    async fn reconcile_key(&self, cancel: &CancellationToken, key: &str) -> Result<Outcome, Error> {
        let (namespace, name) = match split_key(key) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "invalid resource key");
                return Ok(Outcome::InvalidKey);
            }
        };
        info!(ns = %namespace, service = %name, "reconcile");

        let original = match self.read.get_service(namespace, name) {
            Ok(s) => s,
            Err(e) if e.is_not_found() => {
                warn!(key, "service in work queue no longer exists");
                return Ok(Outcome::ServiceGone);
            }
            Err(e) => return Err(e.into()),
        };
        if original.metadata.deletion_timestamp.is_some() {
            return Ok(Outcome::ServiceDeleting);
        }

        // The cached object is shared with every other reader.
        let service: Service = (*original).clone();

        match self.reconcile_service(cancel, &service).await {
            Ok(o) => Ok(o),
            Err(Error::Cancelled) => {
                info!(ns = %namespace, service = %name, "reconcile cancelled");
                Err(Error::Cancelled)
            }
            Err(e) => {
                self.events
                    .publish(
                        &service.object_ref(&()),
                        EventType::Warning,
                        reasons::INTERNAL_ERROR,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
                error!(ns = %namespace, service = %name, error = %e, "reconcile service failed");
                Err(e)
            }
        }
    }

    /// Read-only half of a reconciliation.
    pub fn plan(&self, service: &Service) -> Result<Decision, Error> {
        decision::plan(self.read.as_ref(), service)
    }

    async fn reconcile_service(&self, cancel: &CancellationToken, service: &Service) -> Result<Outcome, Error> {
        let plan = match self.plan(service)? {
            Decision::NoOp(reason) => return Ok(Outcome::NoOp(reason)),
            Decision::Collect(plan) => plan,
        };
        let report =
            sweep::sweep(self.ops.as_ref(), self.events.as_ref(), cancel, &service.object_ref(&()), &plan).await?;
        if !plan.superseded.is_empty() {
            info!(
                ns = %plan.namespace,
                service = %plan.service,
                latest = %plan.latest.name,
                deleted = report.deleted.len(),
                already_gone = report.already_gone.len(),
                failed = report.failed.len(),
                "superseded revisions swept"
            );
        }
        Ok(Outcome::Swept { plan, report })
    }
}
