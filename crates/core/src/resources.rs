//! Serving resource definitions.
//!
//! Only the fields the garbage collector reads are typed; everything else in
//! a `.spec` body is carried through as raw JSON. The CRDs themselves are
//! installed and owned by the serving controllers, so no schema is generated.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Top-level intent object. Its body is opaque to the collector.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1alpha1",
    kind = "Service",
    plural = "services",
    namespaced,
    schema = "disabled"
)]
pub struct ServiceSpec {
    #[serde(flatten)]
    pub body: BTreeMap<String, serde_json::Value>,
}

/// Live traffic distribution for a Service.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1alpha1",
    kind = "Route",
    plural = "routes",
    namespaced,
    status = "RouteStatus",
    schema = "disabled"
)]
pub struct RouteSpec {
    #[serde(flatten)]
    pub body: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    /// `None` until the route controller has populated traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic: Option<Vec<TrafficTarget>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// One entry of `status.traffic`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_name: Option<String>,
    /// Set when this target follows the Configuration's latest ready Revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl TrafficTarget {
    pub fn follows_latest(&self) -> bool {
        self.latest_revision.unwrap_or(false)
    }
}

/// Immutable, generation-stamped workload snapshot.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1alpha1",
    kind = "Revision",
    plural = "revisions",
    namespaced,
    schema = "disabled"
)]
pub struct RevisionSpec {
    #[serde(flatten)]
    pub body: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_status_distinguishes_missing_traffic() {
        let route: Route = serde_json::from_value(serde_json::json!({
            "apiVersion": "serving.knative.dev/v1alpha1",
            "kind": "Route",
            "metadata": { "name": "svc", "namespace": "default" },
            "spec": {},
            "status": { "url": "http://svc.default.example.com" }
        }))
        .expect("route");
        let status = route.status.expect("status");
        assert!(status.traffic.is_none());
    }

    #[test]
    fn traffic_target_parses_camel_case() {
        let t: TrafficTarget = serde_json::from_value(serde_json::json!({
            "revisionName": "svc-00003",
            "latestRevision": true,
            "percent": 100
        }))
        .expect("target");
        assert_eq!(t.revision_name.as_deref(), Some("svc-00003"));
        assert!(t.follows_latest());
        assert_eq!(t.percent, Some(100));
    }

    #[test]
    fn absent_latest_flag_is_not_latest() {
        let t = TrafficTarget { revision_name: Some("svc-00001".into()), ..Default::default() };
        assert!(!t.follows_latest());
    }

    #[test]
    fn spec_body_is_preserved() {
        let svc: Service = serde_json::from_value(serde_json::json!({
            "apiVersion": "serving.knative.dev/v1alpha1",
            "kind": "Service",
            "metadata": { "name": "svc", "namespace": "default" },
            "spec": { "runLatest": { "configuration": {} } }
        }))
        .expect("service");
        assert!(svc.spec.body.contains_key("runLatest"));
    }
}
