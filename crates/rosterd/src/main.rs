use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod error;
mod pipeline;
mod relay;
mod state;
mod ws;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rosterd starting");

    let config = config::Config::from_env();
    tracing::info!(
        bind = %config.bind_addr(),
        db = %config.db_path.display(),
        cache = ?config.cache_mode,
        local_only = config.local_only,
        "configuration loaded"
    );

    let state = Arc::new(state::AppState::from_config(config).await?);
    let active = state.cache.refresh().await;
    tracing::info!(backend = active.as_str(), "cooldown cache ready");
    let monitor = state.cache.clone().spawn_monitor(state.config.cache_reprobe);

    let listener = tokio::net::TcpListener::bind(state.config.bind_addr())
        .await
        .with_context(|| format!("binding {}", state.config.bind_addr()))?;
    tracing::info!(addr = %listener.local_addr()?, "rosterd ready");

    let app = api::router(state.clone());
    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("rosterd shutting down");
    monitor.abort();
    state.runner.shutdown().await;
    state.cache.shutdown().await;

    served.context("http server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
