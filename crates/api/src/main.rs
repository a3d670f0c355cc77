use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tid_core::error::CoreError;
use tid_core::orchestrator::JobOrchestrator;
use tid_core::tasks::builtin_tasks;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tid_api::app::build_app;
use tid_api::config::ServerConfig;
use tid_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tid_api=debug,tid_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CoreError> {
    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Orchestrator ---
    let definitions = builtin_tasks(
        &config.orchestrator.python,
        &config.orchestrator.root_marker,
    );
    let orchestrator =
        Arc::new(JobOrchestrator::start(config.orchestrator.clone(), definitions).await?);

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        orchestrator: Arc::clone(&orchestrator),
    };
    let app = build_app(state)?;

    // --- Start server ---
    let host = config
        .host
        .parse::<IpAddr>()
        .map_err(|e| CoreError::Config(format!("Invalid HOST '{}': {e}", config.host)))?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| CoreError::Config(format!("Failed to bind {addr}: {e}")))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| CoreError::Internal(format!("Server error: {e}")))?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, draining jobs");
    let drain_timeout = Duration::from_secs(config.shutdown_timeout_secs);
    if orchestrator.drain(drain_timeout).await {
        tracing::info!("All jobs finished");
    } else {
        tracing::warn!(
            remaining = orchestrator.active_jobs(),
            "Shutdown timeout reached, remaining jobs will be killed",
        );
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
