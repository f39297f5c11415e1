use futures_util::StreamExt;
use k8s_openapi::api::{apps::v1::Deployment, batch::v1::Job, core::v1::Service, networking::v1::Ingress};
use kube::{Api, Client};
use kube_runtime::{watcher, Controller};
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, info, warn};

use keel_operator::{
    cluster::KubeCluster,
    config::OperatorConfig,
    logging::init_logging,
    reconciler::{error_policy, reconcile, Context},
    revision::RevisionResolver,
    telemetry, KeelApp,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::load()?;
    init_logging(&config.log_level, &config.log_format)?;

    let client = Client::try_default().await?;
    let resolver = RevisionResolver::with_git_remote(config.git_timeout(), config.git.ssh_hosts.clone(), config.git.token_username.clone())?;
    let metrics_addr: SocketAddr = config.metrics_addr.parse()?;
    let ctx = Arc::new(Context { cluster: KubeCluster::new(client.clone()), resolver, config: Arc::new(config) });

    let listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%metrics_addr, "telemetry.listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, telemetry::router()).await {
            warn!(error=%e, "telemetry.server_stopped");
        }
    });

    info!("operator.starting");
    let wc = watcher::Config::default();
    Controller::new(Api::<KeelApp>::all(client.clone()), wc.clone())
        .owns(Api::<Deployment>::all(client.clone()), wc.clone())
        .owns(Api::<Service>::all(client.clone()), wc.clone())
        .owns(Api::<Ingress>::all(client.clone()), wc.clone())
        .owns(Api::<Job>::all(client), wc)
        .shutdown_on_signal()
        .run(reconcile::<KubeCluster>, error_policy::<KubeCluster>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(app=%obj.name, namespace=?obj.namespace, "reconcile.ok"),
                Err(e) => warn!(error=%e, "reconcile.failed"),
            }
        })
        .await;
    info!("operator.stopped");
    Ok(())
}
