//! Beer API Server - Main entry point.
//!
//! This binary starts the Beer API server with:
//! - Structured JSON logging for production
//! - Graceful shutdown handling (SIGTERM/SIGINT) that also closes open
//!   notification websockets
//!
//! # Configuration
//!
//! See [`beerapi_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! BEERAPI_SECRET_KEY="$(openssl rand -hex 32)" \
//! PORT=3000 \
//! cargo run --release --bin beerapi-server
//! ```

use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use beerapi_server::config::Config;
use beerapi_server::error::ServerError;
use beerapi_server::registry::ConnectionRegistry;
use beerapi_server::routes::{create_router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    init_logging();

    match run().await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(ServerError::Config(err)) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  BEERAPI_SECRET_KEY              - Secret used to sign access tokens");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                            - HTTP server port (default: 3000)");
            eprintln!("  BEERAPI_URL_PREFIX              - REST route prefix (default: /api/v1)");
            eprintln!("  BEERAPI_BASE_URL                - Base URL for links (default: http://localhost:PORT)");
            eprintln!("  BEERAPI_WS_IDLE_TIMEOUT_SECS    - Close idle websockets (default: 0, off)");
            eprintln!("  BEERAPI_WS_MAX_MALFORMED_FRAMES - Malformed frame limit (default: 0, unlimited)");
            eprintln!("  RUST_LOG                        - Log level filter (default: info)");
            ExitCode::from(1)
        }
        Err(err) => {
            error!(error = %err, "Server error");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<(), ServerError> {
    let config = Config::from_env()?;

    info!(
        port = config.port,
        url_prefix = %config.url_prefix,
        base_url = %config.base_url,
        idle_timeout_secs = config.connection.idle_timeout.map(|t| t.as_secs()),
        max_malformed_frames = config.connection.max_malformed_frames,
        "Beer API server starting"
    );

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let state = AppState::new(config);
    let registry = state.registry.clone();
    let app = create_router(state);

    let listener = TcpListener::bind(&bind_addr).await.map_err(|err| {
        error!(error = %err, address = %bind_addr, "Failed to bind to address");
        err
    })?;
    info!(address = %bind_addr, "Server listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        close_connections(&registry);
    });

    info!("Server ready to accept connections");
    server.await?;

    info!("Server shutting down gracefully");
    Ok(())
}

/// Asks every live websocket to close so its task can unregister and exit.
fn close_connections(registry: &ConnectionRegistry) {
    let connections = registry.snapshot();
    info!(count = connections.len(), "Closing websocket connections");
    for conn in connections {
        conn.close();
    }
}

/// Initialize structured logging with tracing.
///
/// Configures JSON-formatted output with:
/// - Environment-based log level filtering via RUST_LOG
/// - Default log level of `info`
/// - Target and level information
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Creates a future that resolves when a shutdown signal is received.
///
/// Listens for:
/// - SIGTERM (container orchestrator shutdown)
/// - SIGINT (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
