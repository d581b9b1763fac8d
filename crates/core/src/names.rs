//! Deterministic names of a Service's dependents.
//!
//! A Service owns exactly one Route and one Configuration, both named after it.

use kube::ResourceExt;

use crate::{labels, LabelSelector, Service};

pub fn route_name(service: &Service) -> String {
    service.name_any()
}

pub fn configuration_name(service: &Service) -> String {
    service.name_any()
}

/// Selector matching every Revision stamped from this Service's Configuration.
pub fn revision_selector(service: &Service) -> LabelSelector {
    LabelSelector::from_pairs([
        (labels::SERVICE, service.name_any()),
        (labels::CONFIGURATION, configuration_name(service)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceSpec;

    #[test]
    fn dependents_share_service_name() {
        let svc = Service::new("hello", ServiceSpec::default());
        assert_eq!(route_name(&svc), "hello");
        assert_eq!(configuration_name(&svc), "hello");
    }

    #[test]
    fn selector_uses_ownership_labels() {
        let svc = Service::new("hello", ServiceSpec::default());
        let sel = revision_selector(&svc);
        assert_eq!(
            sel.to_string(),
            "serving.knative.dev/configuration=hello,serving.knative.dev/service=hello"
        );
    }
}
