//! revgc core types: serving resources, ownership labels, naming and the read model.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

pub mod generation;
pub mod names;
pub mod resources;
pub mod selector;

pub use generation::{ConfigGeneration, GenerationError};
pub use resources::{Revision, RevisionSpec, Route, RouteSpec, RouteStatus, Service, ServiceSpec, TrafficTarget};
pub use selector::LabelSelector;

/// Label keys stamped on Revisions by the serving controllers.
pub mod labels {
    /// Name of the owning Service.
    pub const SERVICE: &str = "serving.knative.dev/service";
    /// Name of the owning Configuration.
    pub const CONFIGURATION: &str = "serving.knative.dev/configuration";
    /// Generation of the Configuration this Revision was stamped from.
    pub const CONFIGURATION_GENERATION: &str = "serving.knative.dev/configurationGeneration";
}

/// Resource kinds held by the read model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ObjKind {
    Service,
    Route,
    Revision,
}

impl ObjKind {
    pub const ALL: [ObjKind; 3] = [ObjKind::Service, ObjKind::Route, ObjKind::Revision];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjKind::Service => "Service",
            ObjKind::Route => "Route",
            ObjKind::Revision => "Revision",
        }
    }
}

impl std::fmt::Display for ObjKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached object. Shared read-only; never mutate through the `Arc`.
#[derive(Debug, Clone)]
pub enum Object {
    Service(Arc<Service>),
    Route(Arc<Route>),
    Revision(Arc<Revision>),
}

impl Object {
    pub fn kind(&self) -> ObjKind {
        match self {
            Object::Service(_) => ObjKind::Service,
            Object::Route(_) => ObjKind::Route,
            Object::Revision(_) => ObjKind::Revision,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Object::Service(o) => &o.metadata,
            Object::Route(o) => &o.metadata,
            Object::Revision(o) => &o.metadata,
        }
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or("")
    }

    /// `namespace/name` cache key.
    pub fn key(&self) -> String {
        object_key(self.namespace(), self.name())
    }
}

impl From<Service> for Object {
    fn from(v: Service) -> Self { Object::Service(Arc::new(v)) }
}

impl From<Route> for Object {
    fn from(v: Route) -> Self { Object::Route(Arc::new(v)) }
}

impl From<Revision> for Object {
    fn from(v: Revision) -> Self { Object::Revision(Arc::new(v)) }
}

/// A change observed by a watcher.
#[derive(Debug, Clone)]
pub enum Delta {
    Applied(Object),
    Deleted(Object),
    /// Full relist of one kind; replaces everything cached for it.
    Resynced(ObjKind, Vec<Object>),
}

/// Build the `namespace/name` key used by the cache and the dispatcher.
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource key: {0:?}")]
pub struct KeyError(pub String);

/// Split a `namespace/name` (or bare `name`) key into its parts.
pub fn split_key(key: &str) -> Result<(&str, &str), KeyError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok(("", *name)),
        [namespace, name] if !name.is_empty() => Ok((*namespace, *name)),
        _ => Err(KeyError(key.to_string())),
    }
}

/// Read failures from the cached read model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("{kind} {key:?} not found")]
    NotFound { kind: ObjKind, key: String },
    #[error("{kind} cache has not completed its initial list")]
    NotSynced { kind: ObjKind },
}

impl LookupError {
    pub fn not_found(kind: ObjKind, namespace: &str, name: &str) -> Self {
        LookupError::NotFound { kind, key: object_key(namespace, name) }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LookupError::NotFound { .. })
    }
}

/// Eventually-consistent, read-only view over cached serving objects.
///
/// Implementations must be cheap and non-blocking: the reconciler calls these
/// from async context without yielding.
pub trait ReadModel: Send + Sync {
    fn get_service(&self, namespace: &str, name: &str) -> Result<Arc<Service>, LookupError>;
    fn get_route(&self, namespace: &str, name: &str) -> Result<Arc<Route>, LookupError>;
    fn get_revision(&self, namespace: &str, name: &str) -> Result<Arc<Revision>, LookupError>;
    /// Revisions in `namespace` whose labels match every pair in `selector`.
    fn list_revisions(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Arc<Revision>>, LookupError>;
}

impl<T: ReadModel + ?Sized> ReadModel for Arc<T> {
    fn get_service(&self, namespace: &str, name: &str) -> Result<Arc<Service>, LookupError> {
        (**self).get_service(namespace, name)
    }
    fn get_route(&self, namespace: &str, name: &str) -> Result<Arc<Route>, LookupError> {
        (**self).get_route(namespace, name)
    }
    fn get_revision(&self, namespace: &str, name: &str) -> Result<Arc<Revision>, LookupError> {
        (**self).get_revision(namespace, name)
    }
    fn list_revisions(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Arc<Revision>>, LookupError> {
        (**self).list_revisions(namespace, selector)
    }
}

pub mod prelude {
    pub use super::{
        labels, names, ConfigGeneration, Delta, GenerationError, LabelSelector, LookupError, ObjKind, Object, ReadModel,
        Revision, Route, Service, TrafficTarget,
    };
}
