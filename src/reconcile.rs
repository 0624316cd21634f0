//! Reconciliation: converge the cluster's Ingress state to whatever a
//! Service's annotations say it should be.
//!
//! Every pass recomputes the full desired state and the full existing family
//! from scratch - there is no "was this previously managed" memory to get out
//! of sync with cluster truth. That makes at-least-once event delivery safe:
//! replaying an event converges to the same end state.

use std::{sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::{ObjectReference, Service};
use kube::{
    runtime::{
        controller::Action,
        finalizer::{finalizer, Error as FinalizerError, Event as Finalizer},
    },
    Api, Resource, ResourceExt,
};
use tracing::{debug, info, warn};

use crate::{
    gateway::{ClusterGateway, CreateOutcome},
    ingress::{build_ingress, family_prefix, select_port, AUTO_INGRESS_ANNOTATION},
    metrics::{scoped_gauge, scoped_timer},
};

/// Finalizer placed on every watched Service so that deletions are delivered
/// to the cleanup handler before the object disappears.
pub(crate) const FINALIZER: &str = "auto-ingress.dev/cleanup";

/// Fixed requeue delay for recoverable failures. The surrounding runtime owns
/// any permanent-failure policy; we only ever hand back a retry hint.
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Requeue delay when the finalizer add/remove itself races another writer.
const FINALIZER_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// The Service has no ports at all, so there is nothing to route to.
    /// Recoverable: the Service may acquire ports later. No mutation is
    /// attempted on this path.
    #[error("service has no usable port")]
    NoUsablePort,

    /// Anything the cluster API threw at us that is not a 409-on-create or a
    /// 404-on-delete (those are handled inline and never surface here).
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    pub(crate) fn retry_delay(&self) -> Duration {
        match self {
            Error::NoUsablePort | Error::Kube(_) => RETRY_DELAY,
        }
    }
}

/// What a reconcile pass did, for logging and audit counters.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Created(String),
    Updated(String),
    /// Annotation absent: the named family members were removed (possibly
    /// none, which is the steady state for unmanaged Services).
    Removed(Vec<String>),
}

impl Outcome {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Outcome::Created(_) => "created",
            Outcome::Updated(_) => "updated",
            Outcome::Removed(_) => "removed",
        }
    }
}

pub(crate) struct Reconciler<G> {
    gateway: G,
}

impl<G: ClusterGateway> Reconciler<G> {
    pub(crate) fn new(gateway: G) -> Self {
        Self { gateway }
    }

    /// Handle a Service create/update: decide delete-vs-upsert from the
    /// current annotations and converge.
    pub(crate) async fn apply(&self, svc: &Service) -> Result<Outcome, Error> {
        let name = svc.name_any();
        let namespace = svc.namespace().unwrap_or_default();
        let service_ref = svc.object_ref(&());

        let Some(path) = svc.annotations().get(AUTO_INGRESS_ANNOTATION).cloned() else {
            // annotation removed (or never present): the family prefix is the
            // only record of what we manage, so re-list and delete matches.
            let removed = self.remove_family(&namespace, &name).await?;
            for ingress_name in &removed {
                info!(service = %name, ingress = %ingress_name, "deleted ingress: annotation removed");
                self.gateway
                    .publish_event(
                        "IngressDeleted",
                        format!("Deleted ingress {ingress_name}"),
                        &service_ref,
                    )
                    .await;
            }
            return Ok(Outcome::Removed(removed));
        };

        let ports = svc
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_deref())
            .unwrap_or_default();
        let port = select_port(ports).ok_or(Error::NoUsablePort)?;

        let uid = svc.uid().unwrap_or_default();
        let desired = build_ingress(&namespace, &name, &uid, &path, port);
        let ingress_name = desired.metadata.name.clone().unwrap_or_default();

        match self.gateway.create_ingress(&namespace, &desired).await? {
            CreateOutcome::Created => {
                info!(service = %name, ingress = %ingress_name, %path, "created ingress");
                self.gateway
                    .publish_event(
                        "IngressCreated",
                        format!("Created ingress {ingress_name}"),
                        &service_ref,
                    )
                    .await;
                Ok(Outcome::Created(ingress_name))
            }
            CreateOutcome::AlreadyExists => {
                // a prior reconcile (or another actor) got there first under
                // the same deterministic name. converge with a full patch.
                self.gateway
                    .patch_ingress(&namespace, &ingress_name, &desired)
                    .await?;
                info!(service = %name, ingress = %ingress_name, %path, "updated ingress");
                self.gateway
                    .publish_event(
                        "IngressUpdated",
                        format!("Updated ingress {ingress_name}"),
                        &service_ref,
                    )
                    .await;
                Ok(Outcome::Updated(ingress_name))
            }
        }
    }

    /// Handle a Service deletion: remove every family member. Relies purely
    /// on the naming convention, since the deleted Service may already have
    /// lost its annotations.
    pub(crate) async fn cleanup(&self, svc: &Service) -> Result<Vec<String>, Error> {
        let name = svc.name_any();
        let namespace = svc.namespace().unwrap_or_default();

        debug!(service = %name, %namespace, "cleaning up ingresses for deleted service");

        let removed = self.remove_family(&namespace, &name).await?;
        for ingress_name in &removed {
            info!(service = %name, ingress = %ingress_name, "deleted ingress: service deleted");
            self.gateway
                .publish_event(
                    "IngressDeleted",
                    format!("Deleted ingress {ingress_name}"),
                    &ingress_ref(&namespace, ingress_name),
                )
                .await;
        }
        Ok(removed)
    }

    /// List the namespace and delete every Ingress whose name prefix-matches
    /// this Service's family. Deleting an empty family is a no-op.
    async fn remove_family(
        &self,
        namespace: &str,
        service_name: &str,
    ) -> Result<Vec<String>, kube::Error> {
        let prefix = family_prefix(service_name);
        let mut removed = Vec::new();

        for ingress in self.gateway.list_ingresses(namespace).await? {
            let Some(name) = ingress.metadata.name else {
                continue;
            };
            if name.starts_with(&prefix) {
                self.gateway.delete_ingress(namespace, &name).await?;
                removed.push(name);
            }
        }

        Ok(removed)
    }
}

fn ingress_ref(namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("networking.k8s.io/v1".to_string()),
        kind: Some("Ingress".to_string()),
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Shared state handed to every reconcile invocation by the controller.
pub(crate) struct Context<G> {
    pub(crate) client: kube::Client,
    pub(crate) reconciler: Reconciler<G>,
}

/// The controller entrypoint for one Service event. The finalizer wrapper
/// turns the watch stream into an explicit apply/cleanup dispatch and makes
/// sure deletions reach [Reconciler::cleanup] before the Service is gone.
pub(crate) async fn reconcile_service<G: ClusterGateway>(
    svc: Arc<Service>,
    ctx: Arc<Context<G>>,
) -> Result<Action, FinalizerError<Error>> {
    let _active = scoped_gauge!("reconcile.active");

    let namespace = svc.namespace().unwrap_or_default();
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&services, FINALIZER, svc, |event| async {
        match event {
            Finalizer::Apply(svc) => {
                let _timer = scoped_timer!("reconcile_time", "op" => "apply");
                let outcome = ctx.reconciler.apply(&svc).await?;
                ::metrics::counter!("reconcile.outcomes", "outcome" => outcome.label()).increment(1);
                Ok(Action::await_change())
            }
            Finalizer::Cleanup(svc) => {
                let _timer = scoped_timer!("reconcile_time", "op" => "cleanup");
                ctx.reconciler.cleanup(&svc).await?;
                ::metrics::counter!("reconcile.outcomes", "outcome" => "cleaned").increment(1);
                Ok(Action::await_change())
            }
        }
    })
    .await
}

/// Per-object failure isolation: map any error to a requeue and keep going.
pub(crate) fn error_policy<G: ClusterGateway>(
    svc: Arc<Service>,
    err: &FinalizerError<Error>,
    _ctx: Arc<Context<G>>,
) -> Action {
    let delay = match err {
        FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e.retry_delay(),
        _ => FINALIZER_RETRY_DELAY,
    };
    warn!(service = %svc.name_any(), err = %err, delay_secs = delay.as_secs(), "reconcile failed, requeueing");
    Action::requeue(delay)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ingress::ingress_name;
    use k8s_openapi::{
        api::{
            core::v1::{ServicePort, ServiceSpec},
            networking::v1::Ingress,
        },
        apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
    };
    use kube::core::ErrorResponse;
    use std::{collections::BTreeMap, sync::Mutex};

    /// In-memory stand-in for the cluster: a map of ingresses by name plus a
    /// log of every call, so tests can assert on exactly which operations a
    /// reconcile performed.
    #[derive(Default)]
    struct FakeGateway {
        objects: Mutex<BTreeMap<String, Ingress>>,
        calls: Mutex<Vec<String>>,
        events: Mutex<Vec<String>>,
        fail_list: Mutex<bool>,
    }

    impl FakeGateway {
        fn with_ingresses(names: &[&str]) -> Self {
            let fake = Self::default();
            {
                let mut objects = fake.objects.lock().unwrap();
                for name in names {
                    objects.insert(
                        name.to_string(),
                        Ingress {
                            metadata: ObjectMeta {
                                name: Some(name.to_string()),
                                ..Default::default()
                            },
                            ..Default::default()
                        },
                    );
                }
            }
            fake
        }

        fn names(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    fn transient_error() -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the server is currently unable to handle the request".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        })
    }

    impl ClusterGateway for &FakeGateway {
        async fn list_ingresses(&self, namespace: &str) -> Result<Vec<Ingress>, kube::Error> {
            self.calls.lock().unwrap().push(format!("list {namespace}"));
            if *self.fail_list.lock().unwrap() {
                return Err(transient_error());
            }
            Ok(self.objects.lock().unwrap().values().cloned().collect())
        }

        async fn create_ingress(
            &self,
            namespace: &str,
            ingress: &Ingress,
        ) -> Result<CreateOutcome, kube::Error> {
            let name = ingress.metadata.name.clone().unwrap_or_default();
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {namespace}/{name}"));

            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(&name) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            objects.insert(name, ingress.clone());
            Ok(CreateOutcome::Created)
        }

        async fn patch_ingress(
            &self,
            namespace: &str,
            name: &str,
            ingress: &Ingress,
        ) -> Result<(), kube::Error> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("patch {namespace}/{name}"));
            self.objects
                .lock()
                .unwrap()
                .insert(name.to_string(), ingress.clone());
            Ok(())
        }

        async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete {namespace}/{name}"));
            // absent is fine, same as a 404 from the real API
            self.objects.lock().unwrap().remove(name);
            Ok(())
        }

        async fn publish_event(
            &self,
            reason: &'static str,
            note: String,
            _regarding: &ObjectReference,
        ) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{reason}: {note}"));
        }
    }

    fn http_port() -> ServicePort {
        ServicePort {
            name: Some("http".to_string()),
            port: 80,
            target_port: Some(IntOrString::Int(8080)),
            ..Default::default()
        }
    }

    fn service(annotation: Option<&str>, ports: Vec<ServicePort>) -> Service {
        let annotations: Option<BTreeMap<String, String>> = annotation
            .map(|path| [(AUTO_INGRESS_ANNOTATION.to_string(), path.to_string())].into());

        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("ns1".to_string()),
                uid: Some("uid-123".to_string()),
                annotations,
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_flow() {
        let fake = FakeGateway::default();
        let reconciler = Reconciler::new(&fake);

        let outcome = reconciler
            .apply(&service(Some("/app"), vec![http_port()]))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Created("auto-ingress-web-http".to_string()));
        assert_eq!(fake.names(), vec!["auto-ingress-web-http"]);
        assert_eq!(fake.calls(), vec!["create ns1/auto-ingress-web-http"]);
        assert_eq!(
            fake.events(),
            vec!["IngressCreated: Created ingress auto-ingress-web-http"]
        );

        // the created object carries the uid from the event
        let objects = fake.objects.lock().unwrap();
        let owner = &objects["auto-ingress-web-http"]
            .metadata
            .owner_references
            .as_ref()
            .unwrap()[0];
        assert_eq!(owner.uid, "uid-123");
        assert_eq!(owner.name, "web");
    }

    #[tokio::test]
    async fn test_reapply_takes_conflict_patch_path() {
        let fake = FakeGateway::default();
        let reconciler = Reconciler::new(&fake);
        let svc = service(Some("/app"), vec![http_port()]);

        let first = reconciler.apply(&svc).await.unwrap();
        let second = reconciler.apply(&svc).await.unwrap();

        assert_eq!(first, Outcome::Created("auto-ingress-web-http".to_string()));
        assert_eq!(second, Outcome::Updated("auto-ingress-web-http".to_string()));
        // still exactly one object, no duplicates
        assert_eq!(fake.names(), vec!["auto-ingress-web-http"]);
        assert_eq!(
            fake.calls(),
            vec![
                "create ns1/auto-ingress-web-http",
                "create ns1/auto-ingress-web-http",
                "patch ns1/auto-ingress-web-http",
            ]
        );
    }

    #[tokio::test]
    async fn test_annotation_removed_converges_to_deletion() {
        let fake = FakeGateway::with_ingresses(&[
            "auto-ingress-web-http",
            "auto-ingress-web2-http", // another service's family
            "unrelated",
        ]);
        let reconciler = Reconciler::new(&fake);

        let outcome = reconciler
            .apply(&service(None, vec![http_port()]))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Removed(vec!["auto-ingress-web-http".to_string()])
        );
        // the neighbor's family and unrelated objects are untouched
        assert_eq!(fake.names(), vec!["auto-ingress-web2-http", "unrelated"]);
        assert_eq!(
            fake.calls(),
            vec!["list ns1", "delete ns1/auto-ingress-web-http"]
        );
        assert_eq!(
            fake.events(),
            vec!["IngressDeleted: Deleted ingress auto-ingress-web-http"]
        );
    }

    #[tokio::test]
    async fn test_annotation_removed_empty_family_is_noop() {
        let fake = FakeGateway::default();
        let reconciler = Reconciler::new(&fake);

        let outcome = reconciler
            .apply(&service(None, vec![http_port()]))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Removed(vec![]));
        assert_eq!(fake.calls(), vec!["list ns1"]);
        assert!(fake.events().is_empty());
    }

    #[tokio::test]
    async fn test_no_ports_is_precondition_failure() {
        let fake = FakeGateway::default();
        let reconciler = Reconciler::new(&fake);

        let err = reconciler
            .apply(&service(Some("/app"), vec![]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoUsablePort));
        assert_eq!(err.retry_delay(), Duration::from_secs(10));
        // zero mutations attempted
        assert!(fake.calls().is_empty());
        assert!(fake.names().is_empty());
    }

    #[tokio::test]
    async fn test_port_fallback_to_first() {
        let fake = FakeGateway::default();
        let reconciler = Reconciler::new(&fake);

        let metrics_port = ServicePort {
            name: Some("metrics".to_string()),
            port: 9090,
            ..Default::default()
        };
        let outcome = reconciler
            .apply(&service(Some("/metrics"), vec![metrics_port]))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Created(ingress_name("web", "metrics"))
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_whole_family() {
        let fake = FakeGateway::with_ingresses(&[
            "auto-ingress-web-http",
            "auto-ingress-web-grpc",
            "auto-ingress-web2-http",
            "unrelated",
        ]);
        let reconciler = Reconciler::new(&fake);

        // the delete event may arrive with annotations already gone
        let removed = reconciler
            .cleanup(&service(None, vec![]))
            .await
            .unwrap();

        assert_eq!(
            removed,
            vec![
                "auto-ingress-web-grpc".to_string(),
                "auto-ingress-web-http".to_string(),
            ]
        );
        assert_eq!(fake.names(), vec!["auto-ingress-web2-http", "unrelated"]);
        assert_eq!(
            fake.events(),
            vec![
                "IngressDeleted: Deleted ingress auto-ingress-web-grpc",
                "IngressDeleted: Deleted ingress auto-ingress-web-http",
            ]
        );
    }

    #[tokio::test]
    async fn test_transient_list_failure_surfaces_with_retry_hint() {
        let fake = FakeGateway::default();
        *fake.fail_list.lock().unwrap() = true;
        let reconciler = Reconciler::new(&fake);

        let err = reconciler
            .apply(&service(None, vec![http_port()]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Kube(_)));
        assert_eq!(err.retry_delay(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_idempotent_desired_state() {
        // two reconciles of the same input build byte-identical desired state
        let fake = FakeGateway::default();
        let reconciler = Reconciler::new(&fake);
        let svc = service(Some("/app"), vec![http_port()]);

        reconciler.apply(&svc).await.unwrap();
        let first = fake.objects.lock().unwrap()["auto-ingress-web-http"].clone();

        reconciler.apply(&svc).await.unwrap();
        let second = fake.objects.lock().unwrap()["auto-ingress-web-http"].clone();

        assert_eq!(first, second);
    }
}
