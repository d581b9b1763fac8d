//! revgc store: coalescing ingest and immutable cache snapshots

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use revgc_core::{Delta, LabelSelector, LookupError, ObjKind, Object, ReadModel, Revision, Route, Service};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Pending slot identity: a single object, or a whole-kind resync when `key` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Slot {
    kind: ObjKind,
    key: Option<String>,
}

impl Slot {
    fn of(d: &Delta) -> Self {
        match d {
            Delta::Applied(o) | Delta::Deleted(o) => Slot { kind: o.kind(), key: Some(o.key()) },
            Delta::Resynced(kind, _) => Slot { kind: *kind, key: None },
        }
    }
}

/// Coalescing queue keyed by object with FIFO order.
///
/// The last delta per object wins. A resync supersedes every pending delta of its kind.
pub struct Coalescer {
    map: FxHashMap<Slot, Delta>,
    order: VecDeque<Slot>,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::with_capacity(cap) }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn push(&mut self, d: Delta) {
        let slot = Slot::of(&d);
        if slot.key.is_none() {
            let kind = slot.kind;
            self.order.retain(|s| s.kind != kind);
            self.map.retain(|s, _| s.kind != kind);
        }
        if !self.map.contains_key(&slot) {
            self.order.push_back(slot.clone());
        }
        self.map.insert(slot, d);
    }

    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(slot) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&slot) {
                out.push(d);
            }
        }
        out
    }
}

/// Objects of one kind, by namespace then name.
#[derive(Debug)]
pub struct Shelf<T> {
    kind: ObjKind,
    items: FxHashMap<String, FxHashMap<String, Arc<T>>>,
    synced: bool,
}

impl<T> Clone for Shelf<T> {
    fn clone(&self) -> Self {
        Self { kind: self.kind, items: self.items.clone(), synced: self.synced }
    }
}

impl<T> Shelf<T> {
    fn new(kind: ObjKind) -> Self {
        Self { kind, items: FxHashMap::default(), synced: false }
    }

    pub fn is_synced(&self) -> bool { self.synced }

    pub fn len(&self) -> usize { self.items.values().map(|m| m.len()).sum() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn upsert(&mut self, namespace: &str, name: &str, obj: Arc<T>) {
        self.items.entry(namespace.to_string()).or_default().insert(name.to_string(), obj);
    }

    fn remove(&mut self, namespace: &str, name: &str) {
        if let Some(ns) = self.items.get_mut(namespace) {
            ns.remove(name);
            if ns.is_empty() {
                self.items.remove(namespace);
            }
        }
    }

    fn replace_all(&mut self, objs: impl IntoIterator<Item = (String, String, Arc<T>)>) {
        self.items.clear();
        for (namespace, name, obj) in objs {
            self.upsert(&namespace, &name, obj);
        }
        self.synced = true;
    }

    pub fn get(&self, namespace: &str, name: &str) -> Result<Arc<T>, LookupError> {
        if !self.synced {
            return Err(LookupError::NotSynced { kind: self.kind });
        }
        self.items
            .get(namespace)
            .and_then(|ns| ns.get(name))
            .cloned()
            .ok_or_else(|| LookupError::not_found(self.kind, namespace, name))
    }

    /// Objects in `namespace`, sorted by name for a stable iteration order.
    pub fn list(&self, namespace: &str) -> Result<Vec<(&str, &Arc<T>)>, LookupError> {
        if !self.synced {
            return Err(LookupError::NotSynced { kind: self.kind });
        }
        let mut out: Vec<_> = self
            .items
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.as_str(), v)).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.0.cmp(b.0));
        Ok(out)
    }
}

/// Immutable snapshot of everything the collector reads.
#[derive(Debug, Clone)]
pub struct World {
    pub epoch: u64,
    pub services: Shelf<Service>,
    pub routes: Shelf<Route>,
    pub revisions: Shelf<Revision>,
}

impl Default for World {
    fn default() -> Self {
        Self {
            epoch: 0,
            services: Shelf::new(ObjKind::Service),
            routes: Shelf::new(ObjKind::Route),
            revisions: Shelf::new(ObjKind::Revision),
        }
    }
}

impl World {
    /// A fully synced world holding exactly `objs`.
    pub fn from_objects(objs: impl IntoIterator<Item = Object>) -> Self {
        let mut by_kind: FxHashMap<ObjKind, Vec<Object>> = FxHashMap::default();
        for o in objs {
            by_kind.entry(o.kind()).or_default().push(o);
        }
        let mut builder = WorldBuilder::new();
        builder.apply(
            ObjKind::ALL
                .iter()
                .map(|k| Delta::Resynced(*k, by_kind.remove(k).unwrap_or_default()))
                .collect(),
        );
        builder.world
    }

    pub fn is_synced(&self) -> bool {
        self.services.is_synced() && self.routes.is_synced() && self.revisions.is_synced()
    }

    fn upsert(&mut self, o: Object) {
        let (namespace, name) = (o.namespace().to_string(), o.name().to_string());
        match o {
            Object::Service(v) => self.services.upsert(&namespace, &name, v),
            Object::Route(v) => self.routes.upsert(&namespace, &name, v),
            Object::Revision(v) => self.revisions.upsert(&namespace, &name, v),
        }
    }

    fn remove(&mut self, o: &Object) {
        match o.kind() {
            ObjKind::Service => self.services.remove(o.namespace(), o.name()),
            ObjKind::Route => self.routes.remove(o.namespace(), o.name()),
            ObjKind::Revision => self.revisions.remove(o.namespace(), o.name()),
        }
    }

    fn resync(&mut self, kind: ObjKind, objs: Vec<Object>) {
        fn entries<T>(
            objs: Vec<Object>,
            pick: impl Fn(Object) -> Option<Arc<T>>,
        ) -> Vec<(String, String, Arc<T>)> {
            objs.into_iter()
                .filter_map(|o| {
                    let (ns, name) = (o.namespace().to_string(), o.name().to_string());
                    pick(o).map(|v| (ns, name, v))
                })
                .collect()
        }
        match kind {
            ObjKind::Service => self.services.replace_all(entries(objs, |o| match o {
                Object::Service(v) => Some(v),
                _ => None,
            })),
            ObjKind::Route => self.routes.replace_all(entries(objs, |o| match o {
                Object::Route(v) => Some(v),
                _ => None,
            })),
            ObjKind::Revision => self.revisions.replace_all(entries(objs, |o| match o {
                Object::Revision(v) => Some(v),
                _ => None,
            })),
        }
    }
}

/// Builds World snapshots from deltas.
pub struct WorldBuilder {
    world: World,
}

impl Default for WorldBuilder {
    fn default() -> Self { Self::new() }
}

impl WorldBuilder {
    pub fn new() -> Self { Self { world: World::default() } }

    /// Apply a batch of deltas and bump the epoch.
    pub fn apply(&mut self, batch: Vec<Delta>) {
        for d in batch {
            match d {
                Delta::Applied(o) => self.world.upsert(o),
                Delta::Deleted(o) => self.world.remove(&o),
                Delta::Resynced(kind, objs) => {
                    debug!(kind = %kind, count = objs.len(), "cache resync");
                    self.world.resync(kind, objs);
                }
            }
        }
        self.world.epoch = self.world.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<World> {
        Arc::new(self.world.clone())
    }
}

/// Read handle over the latest snapshot.
#[derive(Clone)]
pub struct Cache {
    snap: Arc<ArcSwap<World>>,
}

impl Cache {
    /// A cache fixed at `world`; never advances.
    pub fn from_world(world: World) -> Self {
        Self { snap: Arc::new(ArcSwap::from_pointee(world)) }
    }

    pub fn current(&self) -> Arc<World> { self.snap.load_full() }
}

impl ReadModel for Cache {
    fn get_service(&self, namespace: &str, name: &str) -> Result<Arc<Service>, LookupError> {
        self.snap.load().services.get(namespace, name)
    }

    fn get_route(&self, namespace: &str, name: &str) -> Result<Arc<Route>, LookupError> {
        self.snap.load().routes.get(namespace, name)
    }

    fn get_revision(&self, namespace: &str, name: &str) -> Result<Arc<Revision>, LookupError> {
        self.snap.load().revisions.get(namespace, name)
    }

    fn list_revisions(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Arc<Revision>>, LookupError> {
        let world = self.snap.load();
        let matched = world
            .revisions
            .list(namespace)?
            .into_iter()
            .filter(|(_, r)| selector.matches(r.metadata.labels.as_ref()))
            .map(|(_, r)| Arc::clone(r))
            .collect();
        Ok(matched)
    }
}

type Ack = oneshot::Sender<u64>;

/// Write side of the cache.
#[derive(Clone)]
pub struct Ingest {
    tx: mpsc::Sender<(Delta, Option<Ack>)>,
}

impl Ingest {
    /// Queue a delta without waiting for it to become readable. False once
    /// the ingest loop has stopped.
    pub async fn send(&self, d: Delta) -> bool {
        self.tx.send((d, None)).await.is_ok()
    }

    /// Queue a delta and wait until a snapshot containing it is readable.
    ///
    /// Returns the epoch of that snapshot, or `None` once the ingest loop has stopped.
    pub async fn apply(&self, d: Delta) -> Option<u64> {
        let (ack, done) = oneshot::channel();
        self.tx.send((d, Some(ack))).await.ok()?;
        done.await.ok()
    }
}

fn publish(builder: &mut WorldBuilder, batch: Vec<Delta>, snap: &ArcSwap<World>, acks: &mut Vec<Ack>) {
    builder.apply(batch);
    let next = builder.freeze();
    let epoch = next.epoch;
    metrics::gauge!("revgc_cache_epoch", epoch as f64);
    metrics::gauge!("revgc_cache_objects", next.services.len() as f64, "kind" => "Service");
    metrics::gauge!("revgc_cache_objects", next.routes.len() as f64, "kind" => "Route");
    metrics::gauge!("revgc_cache_objects", next.revisions.len() as f64, "kind" => "Revision");
    snap.store(next);
    for ack in acks.drain(..) {
        let _ = ack.send(epoch);
    }
}

/// Spawn an ingest loop consuming deltas and swapping snapshots. Returns the write handle and a handle for reads.
pub fn spawn_ingest(cap: usize) -> (Ingest, Cache) {
    let (tx, mut rx) = mpsc::channel::<(Delta, Option<Ack>)>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(World::default()));
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut acks: Vec<Ack> = Vec::new();
        let mut builder = WorldBuilder::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some((d, ack)) => {
                            coalescer.push(d);
                            acks.extend(ack);
                        }
                        None => {
                            debug!("delta channel closed; draining and exiting ingest loop");
                            let batch = coalescer.drain_ready();
                            if !batch.is_empty() {
                                publish(&mut builder, batch, &snap_clone, &mut acks);
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let batch = coalescer.drain_ready();
                    if !batch.is_empty() {
                        publish(&mut builder, batch, &snap_clone, &mut acks);
                    }
                }
            }
        }
        info!("ingest loop stopped");
    });

    (Ingest { tx }, Cache { snap })
}
