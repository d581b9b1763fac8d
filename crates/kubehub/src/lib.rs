//! revgc kubehub: list+watch wiring from the API server into the cache

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams},
    runtime::{
        reflector::ObjectRef,
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use revgc_core::{labels, Delta, ObjKind, Object, Revision, Route, Service};
use revgc_store::Ingest;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

/// Namespaced API, or all namespaces when `namespace` is `None`.
pub fn api_for<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Mirror one watch event into the cache, waiting until it is readable.
///
/// Errors are counted and left for the caller's backoff.
pub async fn forward<K>(ingest: &Ingest, kind: ObjKind, ev: &Result<Event<K>, watcher::Error>)
where
    K: Clone,
    Object: From<K>,
{
    let delta = match ev {
        Ok(Event::Applied(o)) => Delta::Applied(o.clone().into()),
        Ok(Event::Deleted(o)) => Delta::Deleted(o.clone().into()),
        Ok(Event::Restarted(list)) => {
            debug!(kind = %kind, count = list.len(), "watch restart");
            Delta::Resynced(kind, list.iter().cloned().map(Object::from).collect())
        }
        Err(e) => {
            metrics::counter!("revgc_watch_errors_total", 1u64, "kind" => kind.as_str());
            warn!(kind = %kind, error = %e, "watch error; backing off");
            return;
        }
    };
    if ingest.apply(delta).await.is_none() {
        debug!(kind = %kind, "ingest stopped; event not cached");
    }
}

/// List+watch one kind, feeding the cache before each event is yielded.
///
/// Whoever consumes the stream never sees an object the cache does not
/// already hold. Transient watch errors are retried with backoff.
pub fn watch_into_cache<K>(
    api: Api<K>,
    config: watcher::Config,
    kind: ObjKind,
    ingest: Ingest,
) -> impl Stream<Item = Result<Event<K>, watcher::Error>> + Send + 'static
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
    Object: From<K>,
{
    info!(kind = %kind, "watcher started");
    watcher::watcher(api, config).default_backoff().then(move |ev| {
        let ingest = ingest.clone();
        async move {
            forward(&ingest, kind, &ev).await;
            ev
        }
    })
}

async fn list_kind<K>(client: Client, namespace: Option<&str>, kind: ObjKind) -> Result<Delta>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
    Object: From<K>,
{
    let api: Api<K> = api_for(client, namespace);
    let list = api.list(&ListParams::default()).await.with_context(|| format!("listing {}", kind))?;
    Ok(Delta::Resynced(kind, list.items.into_iter().map(Object::from).collect()))
}

/// One-shot list of every kind, as resync deltas.
pub async fn list_once(client: Client, namespace: Option<&str>) -> Result<Vec<Delta>> {
    let (services, routes, revisions) = tokio::try_join!(
        list_kind::<Service>(client.clone(), namespace, ObjKind::Service),
        list_kind::<Route>(client.clone(), namespace, ObjKind::Route),
        list_kind::<Revision>(client, namespace, ObjKind::Revision),
    )?;
    Ok(vec![services, routes, revisions])
}

/// Owning Service of a Route: its service label, else the Route's own name.
pub fn service_for_route(route: &Route) -> Option<ObjectRef<Service>> {
    let ns = route.namespace()?;
    let name = route.labels().get(labels::SERVICE).cloned().unwrap_or_else(|| route.name_any());
    Some(ObjectRef::new(&name).within(&ns))
}

/// Owning Service of a Revision, if it carries the service label.
pub fn service_for_revision(revision: &Revision) -> Option<ObjectRef<Service>> {
    let ns = revision.namespace()?;
    let name = revision.labels().get(labels::SERVICE)?;
    Some(ObjectRef::new(name).within(&ns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use revgc_core::{ReadModel, RevisionSpec, RouteSpec};

    #[test]
    fn route_maps_to_labelled_service() {
        let mut r = Route::new("custom-route", RouteSpec::default());
        r.metadata.namespace = Some("ns".into());
        r.labels_mut().insert(labels::SERVICE.to_string(), "svc".to_string());
        let key = service_for_route(&r).expect("mapped");
        assert_eq!(key.name, "svc");
        assert_eq!(key.namespace.as_deref(), Some("ns"));
    }

    #[test]
    fn unlabelled_route_maps_by_name() {
        let mut r = Route::new("svc", RouteSpec::default());
        r.metadata.namespace = Some("ns".into());
        assert_eq!(service_for_route(&r).expect("mapped").name, "svc");
    }

    #[test]
    fn revision_needs_service_label() {
        let mut rev = Revision::new("svc-00001", RevisionSpec::default());
        rev.metadata.namespace = Some("ns".into());
        assert!(service_for_revision(&rev).is_none());
        rev.labels_mut().insert(labels::SERVICE.to_string(), "svc".to_string());
        assert_eq!(service_for_revision(&rev).expect("mapped").name, "svc");
    }

    #[tokio::test]
    async fn forwarded_event_is_readable_before_it_is_yielded() {
        let (ingest, cache) = revgc_store::spawn_ingest(16);
        forward::<Route>(&ingest, ObjKind::Route, &Ok(Event::Restarted(vec![]))).await;

        let mut r = Route::new("svc", RouteSpec::default());
        r.metadata.namespace = Some("ns".into());
        r.metadata.resource_version = Some("7".into());
        forward(&ingest, ObjKind::Route, &Ok(Event::Applied(r.clone()))).await;
        let cached = cache.get_route("ns", "svc").expect("cached");
        assert_eq!(cached.metadata.resource_version.as_deref(), Some("7"));

        forward(&ingest, ObjKind::Route, &Ok(Event::Deleted(r))).await;
        assert!(cache.get_route("ns", "svc").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn watch_errors_leave_the_cache_untouched() {
        let (ingest, cache) = revgc_store::spawn_ingest(16);
        let err: Result<Event<Route>, watcher::Error> = Err(watcher::Error::NoResourceVersion);
        forward(&ingest, ObjKind::Route, &err).await;
        assert_eq!(cache.current().epoch, 0);
    }

    #[test]
    fn cluster_scoped_objects_are_ignored() {
        let rev = Revision::new("svc-00001", RevisionSpec::default());
        assert!(service_for_revision(&rev).is_none());
        let r = Route::new("svc", RouteSpec::default());
        assert!(service_for_route(&r).is_none());
    }
}
