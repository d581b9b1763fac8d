//! Retention decision: which Revisions of a Service are superseded.
//!
//! Everything here is a read against the cache; no writes happen until the
//! resulting [`Plan`] is swept.

use kube::ResourceExt;
use revgc_core::{names, ConfigGeneration, ReadModel, Service};
use serde::Serialize;
use tracing::{error, info};

use crate::Error;

/// Why a Service needs no collection right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum NoOpReason {
    /// Route not created yet.
    RouteNotFound { route: String },
    /// Route status carries no traffic yet.
    TrafficNotReady { route: String },
    /// Traffic is split across targets; older Revisions may still serve.
    SplitTraffic { route: String, targets: usize },
    /// The sole target is pinned to a named Revision.
    PinnedTraffic { route: String, revision: Option<String> },
}

impl std::fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoOpReason::RouteNotFound { route } => write!(f, "route {} not found", route),
            NoOpReason::TrafficNotReady { route } => write!(f, "route {} status.traffic not populated", route),
            NoOpReason::SplitTraffic { route, targets } => {
                write!(f, "route {} splits traffic across {} targets", route, targets)
            }
            NoOpReason::PinnedTraffic { route, revision } => write!(
                f,
                "route {} pins traffic to {}",
                route,
                revision.as_deref().unwrap_or("(unnamed revision)")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub name: String,
    pub generation: ConfigGeneration,
}

/// Sibling whose generation label could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unreadable {
    pub name: String,
    pub error: String,
}

/// Collection plan for one Service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub namespace: String,
    pub service: String,
    pub latest: Candidate,
    /// Strictly older siblings, in list order.
    pub superseded: Vec<Candidate>,
    /// Siblings at or beyond the latest generation.
    pub retained: Vec<Candidate>,
    pub unreadable: Vec<Unreadable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum Decision {
    NoOp(NoOpReason),
    Collect(Plan),
}

/// Decide which of `service`'s Revisions are superseded.
pub fn plan(read: &dyn ReadModel, service: &Service) -> Result<Decision, Error> {
    let namespace = service.namespace().unwrap_or_default();
    let svc_name = service.name_any();

    let route_name = names::route_name(service);
    let route = match read.get_route(&namespace, &route_name) {
        Ok(r) => r,
        Err(e) if e.is_not_found() => {
            info!(ns = %namespace, service = %svc_name, route = %route_name, "route not found");
            return Ok(Decision::NoOp(NoOpReason::RouteNotFound { route: route_name }));
        }
        Err(e) => return Err(e.into()),
    };

    let traffic = match route.status.as_ref().and_then(|s| s.traffic.as_ref()) {
        Some(t) if !t.is_empty() => t,
        _ => {
            info!(ns = %namespace, service = %svc_name, "route status.traffic is not populated");
            return Ok(Decision::NoOp(NoOpReason::TrafficNotReady { route: route_name }));
        }
    };

    if traffic.len() > 1 {
        info!(ns = %namespace, service = %svc_name, targets = traffic.len(), "route traffic is not latest-revision only");
        return Ok(Decision::NoOp(NoOpReason::SplitTraffic { route: route_name, targets: traffic.len() }));
    }

    let target = &traffic[0];
    if !target.follows_latest() {
        info!(ns = %namespace, service = %svc_name, revision = ?target.revision_name, "route traffic is pinned");
        return Ok(Decision::NoOp(NoOpReason::PinnedTraffic {
            route: route_name,
            revision: target.revision_name.clone(),
        }));
    }

    let latest_name = target
        .revision_name
        .clone()
        .ok_or_else(|| Error::MissingRevisionName { route: route_name.clone() })?;
    let latest_rev = read.get_revision(&namespace, &latest_name).map_err(|e| {
        info!(ns = %namespace, service = %svc_name, revision = %latest_name, error = %e, "get latest revision failed");
        Error::from(e)
    })?;
    let latest_generation = ConfigGeneration::of(&latest_rev).map_err(|source| {
        error!(ns = %namespace, service = %svc_name, revision = %latest_name, error = %source, "latest revision has no usable generation");
        Error::Generation { revision: latest_name.clone(), source }
    })?;

    let siblings = read.list_revisions(&namespace, &names::revision_selector(service)).map_err(|e| {
        info!(ns = %namespace, service = %svc_name, error = %e, "list revisions failed");
        Error::from(e)
    })?;

    let mut plan = Plan {
        namespace: namespace.clone(),
        service: svc_name.clone(),
        latest: Candidate { name: latest_name, generation: latest_generation },
        superseded: Vec::new(),
        retained: Vec::new(),
        unreadable: Vec::new(),
    };
    for rev in siblings {
        let name = rev.name_any();
        match ConfigGeneration::of(&rev) {
            Err(e) => {
                error!(ns = %namespace, service = %svc_name, revision = %name, error = %e, "skipping revision with unreadable generation");
                plan.unreadable.push(Unreadable { name, error: e.to_string() });
            }
            Ok(generation) if generation >= latest_generation => plan.retained.push(Candidate { name, generation }),
            Ok(generation) => plan.superseded.push(Candidate { name, generation }),
        }
    }
    Ok(Decision::Collect(plan))
}
