//! Command dispatch and live state server for a fleet of long-polling robots.

pub mod config;
pub mod hub;
pub mod log_throttle;
pub mod metrics;
pub mod queue;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod telemetry;

use std::future::Future;

use tokio::net::TcpListener;

pub use config::AppConfig;
pub use routes::build_router;
pub use state::AppState;

pub const BUILD_ID: &str = env!("CABOT_DASHBOARD_BUILD_ID");

/// Serves the router on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
