//! Tether Web Server
//!
//! Session-core HTTP service: login, logout, state query and platform switching.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tether_core::TetherConfig;
use tether_web::server::TetherServerBuilder;
use tether_web::{init_logging, WebConfig};
use tracing::info;

/// Tether Web Server - session management for multi-platform accounts
#[derive(Parser)]
#[command(name = "tether-web")]
#[command(about = "Session management service with platform context switching")]
#[command(version)]
struct Args {
    /// Server host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Enable development mode (seeds a demo user and platforms)
    #[arg(long)]
    dev: bool,

    /// Database URL for session storage
    #[arg(long)]
    database_url: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load environment variables
    dotenvy::dotenv().ok();

    let tether = match &args.config {
        Some(path) => TetherConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => TetherConfig::default(),
    }
    .apply_env();

    init_logging(tether.logging.clone(), &args.log_level, args.json_logs)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    let mut config = WebConfig::from_env();
    config.tether = tether;
    config.host = args.host;
    config.port = args.port;
    config.dev_mode = args.dev || config.dev_mode;
    if args.database_url.is_some() {
        config.database_url = args.database_url;
    }

    info!(
        address = %config.address(),
        dev_mode = config.dev_mode,
        storage = config.effective_database_url().unwrap_or("memory"),
        "Starting Tether Web Server"
    );

    let server = TetherServerBuilder::from_config(config)
        .build()
        .await
        .context("failed to build server")?;

    server.start().await.context("server failed")?;

    Ok(())
}
