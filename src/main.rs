//! boxpick - box-id prediction service
//!
//! Serves an upload form and a prediction endpoint: CSV in, CSV with a
//! predicted box identifier out. The trained model artifact is produced by
//! an external pipeline and loaded lazily on first use.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use boxpick::config::{AppConfig, Args};
use boxpick::{build_router, AppState, ModelHandle};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!(
        "Starting boxpick v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let args = Args::parse();
    let config = AppConfig::resolve(&args).context("Failed to resolve configuration")?;

    info!("Model artifact: {}", config.model_path.display());
    if !config.model_path.exists() {
        // Load stays lazy; flag the misconfiguration before the first request hits it
        warn!(
            "Model artifact not found at {} - /predict will fail until it is deployed",
            config.model_path.display()
        );
    }

    let state = AppState::new(ModelHandle::from_path(config.model_path.clone()));
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("boxpick listening on http://{}", addr);
    info!("Health check: http://{}/healthz", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
