//! Parley server entry point.
//!
//! Binary name: `parley`
//!
//! Loads configuration, initializes tracing, then either prints the
//! effective configuration or runs the WebSocket server with its background
//! workers until Ctrl+C or SIGTERM.

mod auth;
mod cli;
mod http;
mod state;

use anyhow::Context;
use clap::Parser;
use parley_observe::tracing_setup::{LogFormat, init_tracing, shutdown_tracing};
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = parley_infra::config::load_config(cli.config.as_deref())
        .await
        .context("failed to load configuration")?;

    if let Commands::Config = cli.command {
        if config.auth.jwt_secret.is_some() {
            config.auth.jwt_secret = Some("<redacted>".to_string());
        }
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let format = LogFormat::from_json_flag(cli.json_logs || config.logging.json);
    init_tracing(cli.log_level(&config.logging.level), format, config.logging.otel)
        .context("failed to initialize tracing")?;

    let result = match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Commands::Config => Ok(()),
    };

    shutdown_tracing();
    result
}

async fn serve(config: parley_types::config::ParleyConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let (state, failures) = AppState::init(config).await?;

    let cancel = CancellationToken::new();
    let workers = state.spawn_background(failures, &cancel);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "Parley listening");

    let db_pool = state.db_pool.clone();
    let router = http::router::build_router(state);
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    cancel.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }
    db_pool.close().await;
    tracing::info!("Server stopped");

    served.context("server error")
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
