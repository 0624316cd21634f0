use std::sync::Arc;

use clap::{Args, Parser};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::{controller::Controller, watcher};
use tracing_subscriber::EnvFilter;

mod gateway;
mod ingress;
mod metrics;
mod reconcile;

use gateway::KubeGateway;
use reconcile::{error_policy, reconcile_service, Context, Reconciler};

/// derive Ingress objects from Service annotations
#[derive(Parser, Debug)]
#[command(version)]
struct CliArgs {
    /// Log in a pretty, human-readable format.
    #[arg(long)]
    log_pretty: bool,

    /// The local address to serve prometheus metrics on. Metrics are disabled
    /// unless this is set.
    #[arg(long)]
    metrics_addr: Option<String>,

    #[command(flatten)]
    namespace_args: NamespaceArgs,
}

#[derive(Args, Debug)]
#[group(multiple = false)]
struct NamespaceArgs {
    /// Watch all namespaces. Defaults to false.
    ///
    /// It's an error to set both --all-namespaces and --namespace.
    #[arg(long)]
    all_namespaces: bool,

    /// The namespace to watch. If this option is not set explicitly,
    /// auto-ingress will watch the namespace set in the kubeconfig's current
    /// context, the namespace specified by the service account the controller
    /// is running as, or the `default` namespace.
    ///
    /// It's an error to set both --all-namespaces and --namespace.
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    setup_tracing(args.log_pretty);

    if let Some(metrics_addr) = &args.metrics_addr {
        metrics::install_prom(metrics_addr)?;
    }

    let client = kube::Client::try_default().await?;
    let services = kube_api::<Service>(
        &client,
        args.namespace_args.all_namespaces,
        args.namespace_args.namespace.as_deref(),
    );

    let ctx = Arc::new(Context {
        client: client.clone(),
        reconciler: Reconciler::new(KubeGateway::new(client)),
    });

    tracing::info!("starting controller");

    Controller::new(services, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_service, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => tracing::debug!(service = %obj.name, "reconciled"),
                // reconcile errors were already logged with context by
                // error_policy; this also catches queue/watch errors.
                Err(e) => tracing::debug!(err = %e, "reconcile failed"),
            }
        })
        .await;

    Ok(())
}

fn setup_tracing(log_pretty: bool) {
    let default_log_filter = "auto_ingress=info"
        .parse()
        .expect("default log filter must be valid");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_filter)
                .from_env_lossy(),
        )
        .with_target(true);

    if log_pretty {
        // don't use .pretty(), it's too pretty
        builder.init();
    } else {
        builder
            .json()
            .flatten_event(true)
            .with_span_list(false)
            .init();
    }
}

fn kube_api<K>(client: &kube::Client, all_namespaces: bool, namespace: Option<&str>) -> kube::Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match (all_namespaces, namespace) {
        (true, _) => kube::Api::all(client.clone()),
        (_, Some(namespace)) => kube::Api::namespaced(client.clone(), namespace),
        _ => kube::Api::default_namespaced(client.clone()),
    }
}
