mod api;
mod config;
mod error;
mod main_lib;
mod scheduler;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ServerConfig;
use crate::main_lib::{app_router, build_state};

const LOG_ENV: &str = "SALLA_MIRROR_LOG";

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ServerConfig::from_env().context("loading configuration")?;
    let state = build_state(&config).context("starting sync engine")?;
    let background = scheduler::spawn_background(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(
        "Salla mirror listening on {} for {} store(s)",
        config.listen_addr,
        config.settings.stores.len()
    );

    axum::serve(listener, app_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // An interrupted pull resumes from its checkpoint on the next start.
    state.shutdown.cancel();
    for handle in background {
        handle.abort();
    }
    Ok(())
}
