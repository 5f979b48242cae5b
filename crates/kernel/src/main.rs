//! Keystone Kernel
//!
//! HTTP server and plugin control-plane client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use keystone_kernel::cli::{self, PluginCommand};
use keystone_kernel::config::Bootstrap;
use keystone_kernel::{AppState, builtin_modules, routes};

#[derive(Parser, Debug)]
#[command(name = "keystone", version, about = "Keystone pluggable runtime")]
struct Cli {
    /// Config file (overrides KEYSTONE_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bundled plugin directory (overrides CORE_PLUGINS_DIR).
    #[arg(long)]
    core_plugins: Option<PathBuf>,

    /// Operator plugin directory (overrides USER_PLUGINS_DIR).
    #[arg(long)]
    user_plugins: Option<PathBuf>,

    /// Example plugin directory (overrides EXAMPLE_PLUGINS_DIR).
    #[arg(long)]
    example_plugins: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (default).
    Serve,
    /// Manage plugins on a running server.
    Plugins {
        #[command(subcommand)]
        action: PluginCommand,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Cli::parse();
    let mut bootstrap = Bootstrap::from_env().context("failed to load bootstrap settings")?;
    if let Some(config) = args.config {
        bootstrap.config_path = config;
    }
    if let Some(dir) = args.core_plugins {
        bootstrap.core_plugins_dir = dir;
    }
    if let Some(dir) = args.user_plugins {
        bootstrap.user_plugins_dir = dir;
    }
    if let Some(dir) = args.example_plugins {
        bootstrap.example_plugins_dir = Some(dir);
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Plugins { action } => Ok(cli::run(&bootstrap.config_path, action).await),
        Command::Serve => {
            init_tracing();
            serve(&bootstrap).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(bootstrap: &Bootstrap) -> Result<()> {
    info!("Starting Keystone kernel");

    let state = AppState::new(bootstrap, builtin_modules())
        .await
        .context("failed to initialize application state")?;

    let report = state.config().report();
    if let Some(backup) = &report.migrated_backup {
        info!(backup = %backup.display(), "Legacy config migrated");
    }
    if !report.generated_secrets.is_empty() {
        info!(secrets = ?report.generated_secrets, "Generated missing secrets");
    }

    state.boot().await;

    let server = state.config().server();
    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .with_context(|| format!("invalid server address {}:{}", server.host, server.port))?;

    let app = routes::app(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind to address")?;

    info!(%addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutting down plugins");
    state.lifecycle().shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
