mod error;
mod middleware;
mod observability;
mod routes;
mod runtime;
mod state;

use std::net::SocketAddr;

use chanlink_domain::util::uuid_v7_without_dashes;
use chanlink_infra::{config::AppConfig, logging::init_tracing};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    observability::init_metrics()?;

    let instance_id = match config.instance_id.trim() {
        "" => uuid_v7_without_dashes(),
        configured => configured.to_string(),
    };
    let (state, publisher) = state::AppState::connect(config.clone(), &instance_id).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = publisher.spawn_supervisor(shutdown_rx.clone());
    let maintenance = runtime::spawn_maintenance(
        state.aggregator.clone(),
        state.store.clone(),
        config.debounce_recovery_interval(),
        shutdown_rx,
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, %instance_id, "starting worker");

    let listener = TcpListener::bind(addr).await?;
    let served = axum::serve(listener, routes::router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    state.aggregator.shutdown().await;
    let _ = shutdown_tx.send(true);
    if let Err(err) = maintenance.await {
        tracing::warn!(error = %err, "maintenance task failed");
    }
    if let Err(err) = supervisor.await {
        tracing::warn!(error = %err, "broker supervisor failed");
    }
    info!("worker shutdown");

    served.map_err(|err| {
        tracing::error!(error = %err, "server exited");
        err
    })?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
