use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use timekeep::clock::SystemClock;
use timekeep::config::{Cli, ServerConfig};
use timekeep::storage::Stores;
use timekeep::telemetry::Telemetry;
use timekeep::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        persistent = config.database_url.is_some(),
        heartbeat_ms = config.sync.heartbeat_interval.as_millis() as u64,
        close_superseded = config.sync.close_superseded,
        session_ttl_secs = config.session_ttl.map(|ttl| ttl.as_secs()),
        "starting timekeep"
    );

    let stores = match &config.database_url {
        Some(url) => Stores::postgres(url, config.db_max_connections)
            .await
            .context("failed to connect to postgres")?,
        None => {
            info!("DATABASE_URL not set; keeping users, sessions and timers in memory");
            Stores::memory()
        }
    };

    let state = AppState::new(
        stores,
        Arc::new(SystemClock),
        config.session_ttl,
        config.sync.clone(),
    )
    .with_metrics(telemetry.metrics_handle());
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("timekeep listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
