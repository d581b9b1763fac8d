//! Dispatcher wiring: runs the reconciler under `kube::runtime::Controller`.
//!
//! The controller owns queueing, per-key deduplication and retry backoff; this
//! module only translates dispatches into `namespace/name` keys. Its trigger
//! streams are the same watches that feed the cache, and each event reaches
//! the controller only after the cache holds it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{reflector, Controller, WatchStreamExt};
use kube::{Client, ResourceExt};
use revgc_core::{object_key, ObjKind, Revision, Route, Service};
use revgc_kubehub::{api_for, service_for_revision, service_for_route, watch_into_cache};
use revgc_reconciler::{Error, Reconciler};
use revgc_store::Ingest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Watch timeout (seconds); must stay below the client read timeout.
const WATCH_TIMEOUT_SECS: u32 = 25;

pub struct Context {
    pub reconciler: Arc<Reconciler>,
    pub cancel: CancellationToken,
    pub error_requeue: Duration,
}

async fn reconcile(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = object_key(&service.namespace().unwrap_or_default(), &service.name_any());
    ctx.reconciler.reconcile(&ctx.cancel, &key).await?;
    Ok(Action::await_change())
}

fn error_policy(service: Arc<Service>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        ns = %service.namespace().unwrap_or_default(),
        service = %service.name_any(),
        error = %error,
        requeue_secs = ctx.error_requeue.as_secs(),
        "reconciliation failed; requeueing"
    );
    Action::requeue(ctx.error_requeue)
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "unable to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Run until SIGINT/SIGTERM. Either signal also cancels in-flight sweeps, so
/// no further deletes are issued once it arrives.
pub async fn run_controller(
    client: Client,
    namespace: Option<&str>,
    reconciler: Arc<Reconciler>,
    ingest: Ingest,
    error_requeue: Duration,
) {
    let cancel = CancellationToken::new();
    let ctx = Arc::new(Context { reconciler, cancel: cancel.clone(), error_requeue });

    let signal_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received; cancelling in-flight sweeps");
            cancel.cancel();
        }
    });

    let cfg = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let (services, writer) = reflector::store::<Service>();
    let service_events = reflector(
        writer,
        watch_into_cache(api_for::<Service>(client.clone(), namespace), cfg(), ObjKind::Service, ingest.clone()),
    )
    .touched_objects();
    let route_events =
        watch_into_cache(api_for::<Route>(client.clone(), namespace), cfg(), ObjKind::Route, ingest.clone())
            .touched_objects();
    let revision_events =
        watch_into_cache(api_for::<Revision>(client, namespace), cfg(), ObjKind::Revision, ingest).touched_objects();

    info!(ns = ?namespace, "revision collector started");
    Controller::for_stream(service_events, services)
        .watches_stream(route_events, |route| service_for_route(&route))
        .watches_stream(revision_events, |revision| service_for_revision(&revision))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(service = %obj, "reconciled"),
                Err(e) => debug!(error = %e, "reconcile dispatch failed"),
            }
        })
        .await;

    signal_task.abort();
    info!("revision collector stopped");
}
