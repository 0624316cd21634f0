//! The cluster gateway: every read and write the reconciler performs against
//! the API server goes through the [ClusterGateway] trait, so tests can swap
//! the whole thing for an in-memory fake. The production implementation is a
//! thin wrapper over `kube::Api<Ingress>` plus an event [Recorder].

use std::future::Future;

use k8s_openapi::api::{core::v1::ObjectReference, networking::v1::Ingress};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Api,
};
use tracing::warn;

/// What happened on a create attempt. A 409 is an expected control-flow
/// branch for us, not an error: the deterministic name means "already exists"
/// is just "someone got there first, patch instead".
#[derive(Debug)]
pub(crate) enum CreateOutcome {
    Created,
    AlreadyExists,
}

pub(crate) trait ClusterGateway: Send + Sync {
    fn list_ingresses(
        &self,
        namespace: &str,
    ) -> impl Future<Output = Result<Vec<Ingress>, kube::Error>> + Send;

    fn create_ingress(
        &self,
        namespace: &str,
        ingress: &Ingress,
    ) -> impl Future<Output = Result<CreateOutcome, kube::Error>> + Send;

    /// Merge-patch an existing Ingress with the full desired object.
    fn patch_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: &Ingress,
    ) -> impl Future<Output = Result<(), kube::Error>> + Send;

    /// Delete an Ingress. Already-absent is success: the desired state is
    /// "gone" either way.
    fn delete_ingress(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), kube::Error>> + Send;

    /// Best-effort audit event attached to the originating object. Failures
    /// are logged and swallowed; events are a trail, not a control channel.
    fn publish_event(
        &self,
        reason: &'static str,
        note: String,
        regarding: &ObjectReference,
    ) -> impl Future<Output = ()> + Send;
}

pub(crate) fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// The real gateway, backed by the cluster API.
#[derive(Clone)]
pub(crate) struct KubeGateway {
    client: kube::Client,
    reporter: Reporter,
}

impl KubeGateway {
    pub(crate) fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: "auto-ingress".into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self { client, reporter }
    }

    fn ingresses(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl ClusterGateway for KubeGateway {
    async fn list_ingresses(&self, namespace: &str) -> Result<Vec<Ingress>, kube::Error> {
        let list = self
            .ingresses(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn create_ingress(
        &self,
        namespace: &str,
        ingress: &Ingress,
    ) -> Result<CreateOutcome, kube::Error> {
        match self
            .ingresses(namespace)
            .create(&PostParams::default(), ingress)
            .await
        {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) if is_conflict(&e) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    async fn patch_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: &Ingress,
    ) -> Result<(), kube::Error> {
        self.ingresses(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(ingress))
            .await?;
        Ok(())
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        match self
            .ingresses(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn publish_event(
        &self,
        reason: &'static str,
        note: String,
        regarding: &ObjectReference,
    ) {
        // the Recorder is scoped to one object reference, so build one per
        // event rather than holding one per gateway
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding.clone());
        let event = Event {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(err = %e, reason, "failed to publish event");
        }
    }
}
