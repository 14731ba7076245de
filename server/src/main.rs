#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # docbrain
//!
//! Remote vision-inference service. Runs next to the GPU, is exposed to the
//! local gateway through an ephemeral encrypted tunnel, and authenticates
//! every request that crosses it.
//!
//! ## API surface
//!
//! | Method | Path        | Auth          | Description                          |
//! |--------|-------------|---------------|--------------------------------------|
//! | GET    | `/`         | No            | Service name and endpoint list       |
//! | GET    | `/health`   | Token         | Readiness, model name, security mode |
//! | POST   | `/analyze`  | Token (+Bearer) | Multipart image + query → text     |
//! | POST   | `/shutdown` | Token         | Graceful shutdown                    |
//!
//! Token is the `X-Sovereign-Token` header. Without a configured token the
//! service runs in development mode and accepts unauthenticated requests.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use docbrain::{engine, router, AppState, Config};

/// Remote vision-inference service.
#[derive(Parser)]
#[command(name = "docbrain", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };

    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("docbrain: configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    match run_server(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> std::io::Result<()> {
    info!("docbrain v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.uses_default_legacy_secret() {
        warn!("Using default legacy secret — set SOVEREIGN_BRAIN_SECRET or update config");
    }
    if config.auth.access_token.is_none() {
        warn!("No access token configured — running in development mode, requests are NOT authenticated");
    }

    let state = AppState::new(config);
    let loader = engine::spawn_loader(&state.config.model, state.engine.clone());
    let app = router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen).await?;
    info!("Server ready");

    let shutdown_token = state.shutdown.clone();
    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        () = shutdown_token.cancelled() => info!("Shutdown requested over HTTP"),
                    }
                }
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {e}");
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT"),
                        () = shutdown_token.cancelled() => info!("Shutdown requested over HTTP"),
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                () = shutdown_token.cancelled() => info!("Shutdown requested over HTTP"),
            }
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Shutting down...");
    if let Some(task) = loader {
        task.abort();
    }
    *state.engine.write().await = None;
    info!("Goodbye");
    Ok(())
}
