//! The pure half of the controller: deterministic naming, port selection, and
//! desired-state construction. Nothing in this module talks to the cluster,
//! which is what makes the reconciler's "recompute everything from scratch"
//! discipline cheap.

use k8s_openapi::{
    api::{
        core::v1::ServicePort,
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, ServiceBackendPort,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{ObjectMeta, OwnerReference},
        util::intstr::IntOrString,
    },
};
use std::collections::BTreeMap;

/// Annotation on a Service that opts it into ingress management. The value is
/// the routing path.
pub(crate) const AUTO_INGRESS_ANNOTATION: &str = "auto-ingress";

/// The entrypoint marker our ingress controller expects on every Ingress we
/// create. Fixed at deploy time, not configurable here.
pub(crate) const INGRESS_CLASS_ANNOTATION: &str = "traefik.ingress.kubernetes.io/router.entrypoints";
pub(crate) const INGRESS_CLASS_VALUE: &str = "web";

const NAME_STEM: &str = "auto-ingress-";
const PATH_TYPE_PREFIX: &str = "Prefix";

/// The deterministic name for the managed Ingress of `(service, port)`.
///
/// Distinct port identifiers give distinct names, and every name starts with
/// [family_prefix] of its Service, so family membership can always be
/// recovered by prefix match with no persisted index.
pub(crate) fn ingress_name(service_name: &str, port_id: &str) -> String {
    format!("{NAME_STEM}{service_name}-{port_id}")
}

/// The name prefix shared by every Ingress managed for `service_name`.
///
/// Ends with the `-` delimiter so that `svc` never prefix-matches the family
/// of `svc2`.
pub(crate) fn family_prefix(service_name: &str) -> String {
    format!("{NAME_STEM}{service_name}-")
}

/// A port's stable identifier: its name when set, its number otherwise.
pub(crate) fn port_id(port: &ServicePort) -> String {
    match port.name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => port.port.to_string(),
    }
}

/// Pick the Service port to route: the port literally named `http` when there
/// is one, otherwise the first port. `None` means the Service has no usable
/// port, which callers treat as a recoverable precondition failure rather
/// than a bug.
pub(crate) fn select_port(ports: &[ServicePort]) -> Option<&ServicePort> {
    ports
        .iter()
        .find(|p| p.name.as_deref() == Some("http"))
        .or_else(|| ports.first())
}

/// Build the full desired Ingress for a Service: a single rule with a single
/// Prefix-matched path, backed by the Service on the selected port. Total and
/// side-effect free.
pub(crate) fn build_ingress(
    namespace: &str,
    service_name: &str,
    service_uid: &str,
    path: &str,
    port: &ServicePort,
) -> Ingress {
    let name = ingress_name(service_name, &port_id(port));

    // route to the targetPort when one is set; a named targetPort maps onto
    // the backend port's name field, a numeric one onto its number.
    let backend_port = match &port.target_port {
        Some(IntOrString::Int(n)) => ServiceBackendPort {
            number: Some(*n),
            ..Default::default()
        },
        Some(IntOrString::String(name)) => ServiceBackendPort {
            name: Some(name.clone()),
            ..Default::default()
        },
        None => ServiceBackendPort {
            number: Some(port.port),
            ..Default::default()
        },
    };

    let annotations: BTreeMap<String, String> = [(
        INGRESS_CLASS_ANNOTATION.to_string(),
        INGRESS_CLASS_VALUE.to_string(),
    )]
    .into();

    Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            annotations: Some(annotations),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".to_string(),
                kind: "Service".to_string(),
                name: service_name.to_string(),
                uid: service_uid.to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(path.to_string()),
                        path_type: PATH_TYPE_PREFIX.to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service_name.to_string(),
                                port: Some(backend_port),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
