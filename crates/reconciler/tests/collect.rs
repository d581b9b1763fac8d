#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use revgc_core::{
    labels, LabelSelector, LookupError, ObjKind, Object, ReadModel, Revision, RevisionSpec, Route, RouteSpec,
    RouteStatus, Service, ServiceSpec, TrafficTarget,
};
use kube::runtime::events::EventType;
use revgc_ops::{DeleteOutcome, MockEventPublisher, MockRevisionOps};
use revgc_reconciler::{Decision, Error, NoOpReason, Outcome, Reconciler};
use revgc_store::{Cache, World};
use tokio_util::sync::CancellationToken;

const NS: &str = "default";

fn service(name: &str) -> Object {
    let mut s = Service::new(name, ServiceSpec::default());
    s.metadata.namespace = Some(NS.to_string());
    s.into()
}

fn latest(revision: &str) -> TrafficTarget {
    TrafficTarget { revision_name: Some(revision.to_string()), latest_revision: Some(true), percent: Some(100), ..Default::default() }
}

fn pinned(revision: &str, percent: i64) -> TrafficTarget {
    TrafficTarget { revision_name: Some(revision.to_string()), latest_revision: Some(false), percent: Some(percent), ..Default::default() }
}

fn route(name: &str, traffic: Option<Vec<TrafficTarget>>) -> Object {
    let mut r = Route::new(name, RouteSpec::default());
    r.metadata.namespace = Some(NS.to_string());
    r.status = Some(RouteStatus { traffic, ..Default::default() });
    r.into()
}

fn revision(svc: &str, name: &str, generation: Option<&str>) -> Object {
    let mut r = Revision::new(name, RevisionSpec::default());
    r.metadata.namespace = Some(NS.to_string());
    let mut l = BTreeMap::from([
        (labels::SERVICE.to_string(), svc.to_string()),
        (labels::CONFIGURATION.to_string(), svc.to_string()),
    ]);
    if let Some(g) = generation {
        l.insert(labels::CONFIGURATION_GENERATION.to_string(), g.to_string());
    }
    r.metadata.labels = Some(l);
    r.into()
}

/// `svc` routed to `svc-00003`, with revisions 1..=3.
fn scenario() -> Vec<Object> {
    vec![
        service("svc"),
        route("svc", Some(vec![latest("svc-00003")])),
        revision("svc", "svc-00001", Some("1")),
        revision("svc", "svc-00002", Some("2")),
        revision("svc", "svc-00003", Some("3")),
    ]
}

/// Ops double recording every delete and answering with `answer(name)`.
fn recording_ops(
    answer: impl Fn(&str) -> anyhow::Result<DeleteOutcome> + Send + 'static,
) -> (MockRevisionOps, Arc<Mutex<Vec<String>>>) {
    let deleted = Arc::new(Mutex::new(Vec::new()));
    let seen = deleted.clone();
    let mut ops = MockRevisionOps::new();
    ops.expect_delete_revision().returning(move |ns, name| {
        assert_eq!(ns, NS);
        seen.lock().expect("lock").push(name.to_string());
        answer(name)
    });
    (ops, deleted)
}

fn reconciler(objs: Vec<Object>, ops: MockRevisionOps, events: MockEventPublisher) -> Reconciler {
    Reconciler::new(Arc::new(Cache::from_world(World::from_objects(objs))), Arc::new(ops), Arc::new(events))
}

async fn run(r: &Reconciler) -> Result<Outcome, Error> {
    r.reconcile(&CancellationToken::new(), "default/svc").await
}

#[tokio::test]
async fn deletes_strictly_older_revisions_only() {
    let (ops, deleted) = recording_ops(|_| Ok(DeleteOutcome::Deleted));
    let r = reconciler(scenario(), ops, MockEventPublisher::new());

    let out = run(&r).await.expect("reconcile");

    assert_eq!(*deleted.lock().expect("lock"), vec!["svc-00001", "svc-00002"]);
    match out {
        Outcome::Swept { plan, report } => {
            assert_eq!(plan.latest.name, "svc-00003");
            assert_eq!(plan.retained.len(), 1);
            assert_eq!(report.deleted, vec!["svc-00001", "svc-00002"]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn split_traffic_deletes_nothing() {
    let mut objs = scenario();
    objs[1] = route("svc", Some(vec![latest("svc-00003"), pinned("svc-00002", 10)]));
    let r = reconciler(objs, MockRevisionOps::new(), MockEventPublisher::new());

    let out = run(&r).await.expect("reconcile");
    assert_eq!(out, Outcome::NoOp(NoOpReason::SplitTraffic { route: "svc".into(), targets: 2 }));
}

#[tokio::test]
async fn unpopulated_or_pinned_traffic_deletes_nothing() {
    let cases = vec![
        (route("svc", None), NoOpReason::TrafficNotReady { route: "svc".into() }),
        (route("svc", Some(vec![])), NoOpReason::TrafficNotReady { route: "svc".into() }),
        (
            route("svc", Some(vec![pinned("svc-00001", 100)])),
            NoOpReason::PinnedTraffic { route: "svc".into(), revision: Some("svc-00001".into()) },
        ),
        (
            route("svc", Some(vec![TrafficTarget { revision_name: Some("svc-00003".into()), ..Default::default() }])),
            NoOpReason::PinnedTraffic { route: "svc".into(), revision: Some("svc-00003".into()) },
        ),
    ];
    for (rt, reason) in cases {
        let mut objs = scenario();
        objs[1] = rt;
        let r = reconciler(objs, MockRevisionOps::new(), MockEventPublisher::new());
        assert_eq!(run(&r).await.expect("reconcile"), Outcome::NoOp(reason));
    }
}

#[tokio::test]
async fn missing_route_status_is_not_ready() {
    let mut objs = scenario();
    let mut r = Route::new("svc", RouteSpec::default());
    r.metadata.namespace = Some(NS.to_string());
    objs[1] = r.into();
    let rec = reconciler(objs, MockRevisionOps::new(), MockEventPublisher::new());
    assert_eq!(run(&rec).await.expect("reconcile"), Outcome::NoOp(NoOpReason::TrafficNotReady { route: "svc".into() }));
}

#[tokio::test]
async fn rerun_after_cleanup_is_idempotent() {
    let objs = vec![
        service("svc"),
        route("svc", Some(vec![latest("svc-00003")])),
        revision("svc", "svc-00003", Some("3")),
        revision("svc", "svc-00004", Some("4")),
    ];
    let r = reconciler(objs, MockRevisionOps::new(), MockEventPublisher::new());
    match run(&r).await.expect("reconcile") {
        Outcome::Swept { plan, report } => {
            assert!(plan.superseded.is_empty());
            assert_eq!(plan.retained.len(), 2);
            assert_eq!(report, Default::default());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn one_delete_per_superseded_sibling() {
    let mut objs = vec![service("svc"), route("svc", Some(vec![latest("svc-00010")]))];
    for g in 1..=10 {
        objs.push(revision("svc", &format!("svc-{:05}", g), Some(&g.to_string())));
    }
    // Different service in the same namespace is never touched
    objs.push(revision("other", "other-00001", Some("1")));
    let (ops, deleted) = recording_ops(|_| Ok(DeleteOutcome::Deleted));
    let r = reconciler(objs, ops, MockEventPublisher::new());

    run(&r).await.expect("reconcile");

    let mut names = deleted.lock().expect("lock").clone();
    assert_eq!(names.len(), 9);
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 9);
    assert!(!names.iter().any(|n| n == "svc-00010" || n.starts_with("other")));
}

#[tokio::test]
async fn already_deleted_revision_is_not_an_error() {
    let (ops, _) = recording_ops(|name| {
        Ok(if name == "svc-00001" { DeleteOutcome::NotFound } else { DeleteOutcome::Deleted })
    });
    let r = reconciler(scenario(), ops, MockEventPublisher::new());
    match run(&r).await.expect("reconcile") {
        Outcome::Swept { report, .. } => {
            assert_eq!(report.already_gone, vec!["svc-00001"]);
            assert_eq!(report.deleted, vec!["svc-00002"]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn malformed_sibling_is_skipped_others_still_deleted() {
    let mut objs = scenario();
    objs.push(revision("svc", "svc-0000x", Some("x")));
    objs.push(revision("svc", "svc-nolabel", None));
    let (ops, deleted) = recording_ops(|_| Ok(DeleteOutcome::Deleted));
    let r = reconciler(objs, ops, MockEventPublisher::new());

    match run(&r).await.expect("reconcile") {
        Outcome::Swept { plan, .. } => {
            let skipped: Vec<_> = plan.unreadable.iter().map(|u| u.name.as_str()).collect();
            assert_eq!(skipped, vec!["svc-0000x", "svc-nolabel"]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(*deleted.lock().expect("lock"), vec!["svc-00001", "svc-00002"]);
}

#[tokio::test]
async fn failed_delete_is_contained_and_reported() {
    let (ops, deleted) = recording_ops(|name| {
        if name == "svc-00001" {
            Err(anyhow::anyhow!("forbidden"))
        } else {
            Ok(DeleteOutcome::Deleted)
        }
    });
    let mut events = MockEventPublisher::new();
    events.expect_publish().times(1).returning(|_, type_, reason, _, note| {
        assert_eq!(type_, kube::runtime::events::EventType::Warning);
        assert_eq!(reason, "RevisionDeleteFailed");
        assert!(note.unwrap_or_default().contains("svc-00001"));
    });
    let r = reconciler(scenario(), ops, events);

    match run(&r).await.expect("reconcile") {
        Outcome::Swept { report, .. } => {
            assert_eq!(report.failed.len(), 1);
            assert_eq!(report.failed[0].0, "svc-00001");
            assert_eq!(report.deleted, vec!["svc-00002"]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(deleted.lock().expect("lock").len(), 2);
}

#[tokio::test]
async fn missing_latest_revision_is_retried() {
    let mut objs = scenario();
    objs.retain(|o| o.name() != "svc-00003");
    let mut events = MockEventPublisher::new();
    events.expect_publish().times(1).returning(|_, _, reason, _, _| {
        assert_eq!(reason, "InternalError");
    });
    let r = reconciler(objs, MockRevisionOps::new(), events);

    let err = run(&r).await.expect_err("should fail");
    assert!(matches!(err, Error::Lookup(LookupError::NotFound { kind: ObjKind::Revision, .. })));
}

#[tokio::test]
async fn malformed_latest_generation_is_retried() {
    let mut objs = scenario();
    objs[4] = revision("svc", "svc-00003", Some("three"));
    let mut events = MockEventPublisher::new();
    events.expect_publish().times(1).return_const(());
    let r = reconciler(objs, MockRevisionOps::new(), events);

    let err = run(&r).await.expect_err("should fail");
    assert!(matches!(err, Error::Generation { ref revision, .. } if revision == "svc-00003"));
}

#[tokio::test]
async fn latest_target_without_name_is_retried() {
    let mut objs = scenario();
    objs[1] = route("svc", Some(vec![TrafficTarget { latest_revision: Some(true), ..Default::default() }]));
    let mut events = MockEventPublisher::new();
    events.expect_publish().times(1).return_const(());
    let r = reconciler(objs, MockRevisionOps::new(), events);

    assert!(matches!(run(&r).await, Err(Error::MissingRevisionName { .. })));
}

#[tokio::test]
async fn unsynced_cache_is_retried() {
    let cache = Cache::from_world(World::default());
    let r = Reconciler::new(Arc::new(cache), Arc::new(MockRevisionOps::new()), Arc::new(MockEventPublisher::new()));
    let err = run(&r).await.expect_err("should fail");
    assert!(matches!(err, Error::Lookup(LookupError::NotSynced { kind: ObjKind::Service })));
}

/// Cache whose Route or Revision shelf has not finished its first list.
struct Lagging {
    inner: Cache,
    kind: ObjKind,
}

impl ReadModel for Lagging {
    fn get_service(&self, namespace: &str, name: &str) -> Result<Arc<Service>, LookupError> {
        self.inner.get_service(namespace, name)
    }

    fn get_route(&self, namespace: &str, name: &str) -> Result<Arc<Route>, LookupError> {
        if self.kind == ObjKind::Route {
            return Err(LookupError::NotSynced { kind: ObjKind::Route });
        }
        self.inner.get_route(namespace, name)
    }

    fn get_revision(&self, namespace: &str, name: &str) -> Result<Arc<Revision>, LookupError> {
        self.inner.get_revision(namespace, name)
    }

    fn list_revisions(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Arc<Revision>>, LookupError> {
        if self.kind == ObjKind::Revision {
            return Err(LookupError::NotSynced { kind: ObjKind::Revision });
        }
        self.inner.list_revisions(namespace, selector)
    }
}

fn lagging(kind: ObjKind, events: MockEventPublisher) -> Reconciler {
    let read = Lagging { inner: Cache::from_world(World::from_objects(scenario())), kind };
    Reconciler::new(Arc::new(read), Arc::new(MockRevisionOps::new()), Arc::new(events))
}

fn one_internal_error() -> MockEventPublisher {
    let mut events = MockEventPublisher::new();
    events.expect_publish().times(1).returning(|_, type_, reason, _, _| {
        assert_eq!(type_, EventType::Warning);
        assert_eq!(reason, "InternalError");
    });
    events
}

#[tokio::test]
async fn sibling_listing_failure_is_retried() {
    let r = lagging(ObjKind::Revision, one_internal_error());
    let err = run(&r).await.expect_err("should fail");
    assert!(matches!(err, Error::Lookup(LookupError::NotSynced { kind: ObjKind::Revision })));
}

#[tokio::test]
async fn route_read_failure_other_than_not_found_is_retried() {
    let r = lagging(ObjKind::Route, one_internal_error());
    let err = run(&r).await.expect_err("should fail");
    assert!(matches!(err, Error::Lookup(LookupError::NotSynced { kind: ObjKind::Route })));
}

#[tokio::test]
async fn cancelled_sweep_stops_deleting() {
    let (ops, deleted) = recording_ops(|_| Ok(DeleteOutcome::Deleted));
    let r = reconciler(scenario(), ops, MockEventPublisher::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = r.reconcile(&cancel, "default/svc").await.expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled));
    assert!(deleted.lock().expect("lock").is_empty());
}

#[test]
fn plan_performs_no_writes() {
    let r = reconciler(scenario(), MockRevisionOps::new(), MockEventPublisher::new());
    let svc = match &scenario()[0] {
        Object::Service(s) => (**s).clone(),
        _ => unreachable!(),
    };
    match r.plan(&svc).expect("plan") {
        Decision::Collect(plan) => {
            let names: Vec<_> = plan.superseded.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names, vec!["svc-00001", "svc-00002"]);
        }
        other => panic!("unexpected decision {other:?}"),
    }
}
