//! Ralph dashboard server binary.
//!
//! Loads settings, starts the live monitor and serves the HTTP and
//! WebSocket API.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ralph_dashboard_server::config::Args;
use ralph_dashboard_server::{create_app, AppState, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "warn,ralph_dashboard_server=info,ralph_dashboard_core=info".into()
        }))
        .init();

    let settings = Settings::from_args(Args::parse()).context("invalid configuration")?;
    let port = settings.port;
    tracing::info!(
        port,
        project_dirs = ?settings.project_dirs,
        data_dir = %settings.data_dir.display(),
        "Starting ralph-dashboard"
    );

    let state = AppState::new(settings).context("failed to start file watcher")?;
    let report = state.monitor.refresh().await;
    tracing::info!(projects = report.added.len(), "Initial watch set ready");
    state.monitor.start();

    let app = create_app(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
