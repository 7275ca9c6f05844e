//! tally-server - metrics collector server
//!
//! Accepts metric updates from agents, serves lookups and keeps snapshots.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tally_server::{ServerArgs, ServerConfig, ServerFileConfig, TallyServer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "tally-server")]
#[command(about = "Metrics collector server")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server until interrupted
    Run(ServerArgs),

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "tally-server.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env()
        .add_directive("tally_server=info".parse()?)
        .add_directive("tally_audit=info".parse()?);
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Run(args) => run_server(&args).await?,
        Commands::InitConfig { output } => init_config(&output)?,
    }

    Ok(())
}

async fn run_server(args: &ServerArgs) -> anyhow::Result<()> {
    let config = ServerConfig::load(args).context("invalid server configuration")?;
    info!(
        address = %config.address,
        store_interval = ?config.store_interval,
        database = config.database_dsn.is_some(),
        restore = config.restore,
        "starting tally-server"
    );

    let server = TallyServer::from_config(config)
        .await
        .context("failed to initialize server")?;
    server.serve_with_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
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
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    let sample = serde_json::to_string_pretty(&ServerFileConfig::sample())?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, sample)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!("Config written to: {}", output.display());
    Ok(())
}
