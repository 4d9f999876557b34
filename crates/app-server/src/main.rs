mod wiring;

#[cfg(test)]
mod integration_flows;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use observability::init_tracing;
use ops_http::{OpsState, build_router_with_state};
use platform_core::AppConfig;
use rental_domain::SystemClock;
use settlement::{spawn_expiry_sweep_loop, spawn_session_recovery_loop};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("failed to load config")?;
    init_tracing(&config.app.service_name, &config.observability.log_filter);
    info!(
        env = config.app.env.as_str(),
        bind = %config.app.http_bind_addr,
        "starting"
    );

    let stores = wiring::connect_stores(&config.database).await?;
    let gateway = wiring::build_gateway(&config.gateway)?;
    let orchestrator = wiring::build_orchestrator(&config, stores, gateway, Arc::new(SystemClock))?;

    let (sweep_shutdown_tx, sweep_shutdown_rx) = oneshot::channel();
    let sweep = spawn_expiry_sweep_loop(
        orchestrator.lifecycle(),
        orchestrator.clock(),
        Duration::from_secs(config.sweep.interval_secs),
        sweep_shutdown_rx,
    );
    let (recovery_shutdown_tx, recovery_shutdown_rx) = oneshot::channel();
    let recovery = spawn_session_recovery_loop(
        orchestrator.poller(),
        Duration::from_secs(config.poller.recovery_interval_secs),
        config.poller.batch_limit,
        recovery_shutdown_rx,
    );

    let app = build_router_with_state(OpsState {
        orchestrator,
        service_name: config.app.service_name.clone(),
    });
    let listener = TcpListener::bind(&config.app.http_bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.app.http_bind_addr))?;
    info!(addr = %config.app.http_bind_addr, "http listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    let _ = sweep_shutdown_tx.send(());
    let _ = recovery_shutdown_tx.send(());
    let _ = tokio::join!(sweep, recovery);
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
