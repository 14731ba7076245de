//! # docbrain-gateway
//!
//! Local side of docbrain. Opens and supervises the encrypted tunnel to the
//! remote brain, and dispatches vision queries across it with caching,
//! retries and a local fallback model.
//!
//! ## Commands
//!
//! - `expose [--port]` — open the tunnel and keep it healthy until SIGINT/SIGTERM
//! - `analyze --image <path> --query <text> [--timeout-ms]` — one query end to end
//! - `status` — tunnel state plus the remote `/health` answer
//! - `stop-remote` — ask the remote service to shut down, then close the tunnel
//!
//! Every command closes the tunnel before exiting, including on SIGINT/SIGTERM.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};

use docbrain_gateway::{Config, GatewayContext};

#[derive(Parser)]
#[command(name = "docbrain-gateway", version, about = "Tunnel and dispatch gateway for docbrain")]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the tunnel and supervise it until interrupted.
    Expose {
        /// Local port of the remote service (overrides `tunnel.port`).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send one image and query through the gateway.
    Analyze {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        query: String,
        /// Per-attempt remote timeout (overrides `dispatch.timeout_ms`).
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Show tunnel state and remote health.
    Status,
    /// Ask the remote service to shut down gracefully.
    StopRemote,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("docbrain-gateway: configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Expose { port: Some(port) } = &cli.command {
        config.tunnel.port = *port;
    }

    let ctx = match GatewayContext::build(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Failed to initialise gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // `expose` runs until a signal; other commands are interrupted by one.
    let interrupted_code = if matches!(cli.command, Commands::Expose { .. }) {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(130)
    };
    ctx.run_guarded(run(&ctx, cli.command), wait_for_signal())
        .await
        .unwrap_or(interrupted_code)
}

async fn run(ctx: &GatewayContext, command: Commands) -> ExitCode {
    match command {
        Commands::Expose { .. } => expose(ctx).await,
        Commands::Analyze {
            image,
            query,
            timeout_ms,
        } => analyze(ctx, &image, &query, timeout_ms).await,
        Commands::Status => status(ctx).await,
        Commands::StopRemote => stop_remote(ctx).await,
    }
}

async fn expose(ctx: &GatewayContext) -> ExitCode {
    match ctx.init().await {
        Ok(url) => println!("{url}"),
        Err(e) => {
            error!("Failed to open tunnel: {e}");
            return ExitCode::FAILURE;
        }
    }
    std::future::pending().await
}

async fn analyze(
    ctx: &GatewayContext,
    image: &Path,
    query: &str,
    timeout_ms: Option<u64>,
) -> ExitCode {
    let bytes = match std::fs::read(image) {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to read {}: {e}", image.display());
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = ctx.init().await {
        warn!("Tunnel unavailable: {e}");
    }
    let timeout = timeout_ms.map_or_else(|| ctx.config.dispatch.timeout(), Duration::from_millis);

    match ctx.dispatcher.process(&bytes, query, timeout).await {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(category = %e.category(), "Analysis failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn status(ctx: &GatewayContext) -> ExitCode {
    if let Err(e) = ctx.init().await {
        warn!("Tunnel unavailable: {e}");
    }
    let tunnel = ctx.supervisor.status().await;
    let active = tunnel.active;
    let remote = match &tunnel.public_url {
        Some(url) => match ctx.client.health(url).await {
            Ok(body) => body,
            Err(e) => json!({ "error": e.to_string() }),
        },
        None => json!(null),
    };
    let report = json!({
        "tunnel": tunnel,
        "remote": remote,
        "cache": ctx.dispatcher.cache_stats().await,
        "security": ctx.dispatcher.security().status(),
    });
    match serde_json::to_string_pretty(&report) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            error!("Failed to render status: {e}");
            return ExitCode::FAILURE;
        }
    }
    if active {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn stop_remote(ctx: &GatewayContext) -> ExitCode {
    let url = match ctx.init().await {
        Ok(url) => url,
        Err(e) => {
            error!("Failed to open tunnel: {e}");
            return ExitCode::FAILURE;
        }
    };
    match ctx.client.shutdown(&url).await {
        Ok(body) => {
            info!("Remote acknowledged shutdown: {body}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Remote shutdown failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
