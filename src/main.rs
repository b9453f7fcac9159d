//! live-update companion server
//!
//! Runs next to the target application, speaks the framed protocol on
//! stdin/stdout, and relays updates to in-process agents over a Unix socket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use live_update::activator::CommandActivator;
use live_update::config::Config;
use live_update::server::SessionServer;

#[derive(Parser, Debug)]
#[command(name = "live-update-server")]
#[command(about = "Companion server relaying live updates to running processes")]
struct Args {
    /// Serve the deployer over stdin/stdout
    #[arg(long)]
    stdio: bool,

    /// JSON configuration file (defaults to LIVE_UPDATE_CONFIG or built-in defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the framed protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let activator = config
        .activator
        .clone()
        .context("No activator configured")?;

    info!(
        socket_dir = %config.socket_dir.display(),
        activator = %activator.program,
        "Loaded configuration"
    );

    if !args.stdio {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    let mut server = SessionServer::new(
        config.server_config(),
        Arc::new(CommandActivator::new(activator)),
    );
    server
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Companion stopped on a channel error")?;

    info!("Companion exiting");
    Ok(())
}
