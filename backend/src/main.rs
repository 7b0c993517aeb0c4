//! Relay server.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use relay::{config::Config, create_app_with_state, logging, mcp::McpHandler, state::AppState};

/// Relay - MCP Streamable HTTP server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(long, env = "RELAY_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error), overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Extra TOML config file, merged after `.relay.toml`
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_figment(
        args.host,
        args.port,
        args.config,
        args.log_level,
        args.log_file,
    )?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = logging::init_logging(config.log_level.as_deref(), config.log_file.as_deref())?;

    info!("Starting Relay server...");
    info!("Configuration loaded: {:?}", config.transport);

    let engine = Arc::new(McpHandler::new("relay"));
    let state = AppState::new(engine, config.transport.clone());
    let app = create_app_with_state(state.clone());
    let _reaper = state.spawn_reaper();

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!("Server listening on {}", listener.local_addr()?);

    // Set up graceful shutdown handler
    let lifecycle = state.lifecycle();
    let shutdown_signal = async move {
        wait_for_signal().await;
        info!("Shutdown signal received, closing MCP sessions...");

        let report = lifecycle.shutdown().await;
        if report.failures > 0 {
            warn!(
                "{} sessions did not close cleanly (budget exceeded: {})",
                report.failures, report.timed_out
            );
        }
        info!("Server shutting down");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
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
