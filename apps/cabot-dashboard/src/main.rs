use std::net::SocketAddr;

use anyhow::Context;
use cabot_dashboard::{telemetry, AppConfig, AppState, BUILD_ID};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env();
    let _log_guard = telemetry::init_tracing(&cfg.log_filter, cfg.log_path.as_deref());

    let state = AppState::new(&cfg).context("failed to build application state")?;

    let addr: SocketAddr = cfg
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", cfg.bind_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;

    info!(
        build = BUILD_ID,
        %addr,
        poll_timeout_secs = cfg.poll_timeout_secs,
        liveness_timeout_secs = cfg.liveness_timeout().as_secs(),
        robot_message_capacity = cfg.robot_message_capacity,
        global_message_capacity = cfg.global_message_capacity,
        message_window_secs = cfg.message_window_secs,
        "starting cabot dashboard"
    );

    cabot_dashboard::serve(listener, state, shutdown_signal())
        .await
        .context("server shutdown with error")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");
}
