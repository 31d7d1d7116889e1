use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use blobcache::config::Config;
use blobcache::{build_state, http, AppState};

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let app = http::handler::create_router(Arc::clone(&state));

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_requested())
    .await
    .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Resolves once the process is asked to stop: SIGINT or, on unix, SIGTERM.
async fn shutdown_requested() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("SIGTERM stream could not be installed");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(signal = "SIGINT", "shutdown requested");
            }
            _ = sigterm.recv() => {
                tracing::info!(signal = "SIGTERM", "shutdown requested");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("ctrl-c stream could not be installed");
        tracing::info!(signal = "ctrl-c", "shutdown requested");
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- Config ----
    let config = Arc::new(Config::parse());

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        port = config.port,
        cache_dir = %config.cache_dir.display(),
        max_cache_size = ?config.max_cache_size,
        fallback_servers = config.fallback_servers().len(),
        lookup_relays = config.lookup_relays().len(),
        "starting blobcache"
    );

    // ---- State (cache store, HTTP clients) ----
    let state = build_state(Arc::clone(&config)).await?;

    // ---- Serve until shutdown ----
    run_http_server(state).await?;

    tracing::info!("blobcache shut down cleanly");
    Ok(())
}
