use keel_operator::logging::init_logging;
use keel_webhook::{build_router, directory::KubeDirectory, AppState};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level = std::env::var("KEEL_LOG_LEVEL").unwrap_or_else(|_| "info".into());
    let format = std::env::var("KEEL_LOG_FORMAT").unwrap_or_else(|_| "text".into());
    init_logging(&level, &format)?;

    let addr: SocketAddr = std::env::var("KEEL_WEBHOOK_ADDR").unwrap_or_else(|_| "0.0.0.0:8081".into()).parse()?;
    let secret = std::env::var("KEEL_WEBHOOK_SECRET").ok();
    if secret.as_deref().map_or(true, str::is_empty) {
        tracing::warn!("webhook.signature_check_disabled");
    }

    let client = kube::Client::try_default().await?;
    let state = AppState::new(Arc::new(KubeDirectory::new(client)), secret.as_deref());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "webhook.listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;
    info!("webhook.stopped");
    Ok(())
}
