mod api;
mod bootstrap;
mod health;
mod messaging;

use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use frontdesk_core::config::{AppConfig, LoadOptions};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use frontdesk_core::config::LogFormat::*;

    // RUST_LOG wins over the configured level when present.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(app.runtime.workflows().clone().run_scheduler(shutdown_rx));

    let router = Router::new()
        .nest("/api", api::router(app.runtime.clone()))
        .merge(health::router(app.db_pool.clone(), app.runtime.clone()));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("could not bind {address}"))?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "frontdesk-server started"
    );
    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "frontdesk-server stopping"
    );
    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, scheduler).await.is_err() {
        tracing::warn!(
            event_name = "system.server.scheduler_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "workflow scheduler did not stop within the grace period"
        );
    }
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %error,
            "could not listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
