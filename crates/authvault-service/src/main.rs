use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use authvault_core::config::ServiceConfig;
use authvault_core::sqlite::open_pool;
use authvault_service::{build, BundleServer};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Authvault credential bundle service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve bundle creation and lookup requests
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides the configured listen address
        #[arg(long)]
        listen: Option<String>,
    },
    /// Create or upgrade the bundle database, then exit
    Migrate {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load and validate the configuration, printing the effective result
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, listen } => run_command(config, listen).await,
        Commands::Migrate { config } => migrate_command(config).await,
        Commands::CheckConfig { config } => check_config_command(config),
    }
}

async fn run_command(config_path: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    let mut config = ServiceConfig::load(config_path.as_deref())?;
    if let Some(listen) = listen {
        config.listen = listen;
    }
    let app = build(&config).await?;
    let listener = TcpListener::bind(&config.listen).await?;
    let server = Arc::new(BundleServer::new(app.controller.clone()));

    let server_task = tokio::spawn(async move { server.serve(listener).await });

    info!(
        max_requests = config.quota.max_requests,
        window_secs = config.quota.window_secs,
        require_verification = config.access.require_verification,
        "service started"
    );
    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("service stopping");
        }
        res = server_task => {
            res??;
        }
    }
    for task in app.background {
        task.abort();
    }
    Ok(())
}

async fn migrate_command(config_path: Option<PathBuf>) -> Result<()> {
    let config = ServiceConfig::load(config_path.as_deref())?;
    let pool = open_pool(&config.database_url, config.access.store_timeout()).await?;
    pool.close().await;
    info!(database = %config.database_url, "migrations applied");
    Ok(())
}

fn check_config_command(config_path: Option<PathBuf>) -> Result<()> {
    let config = ServiceConfig::load(config_path.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
