//! tally-agent - periodic metrics agent
//!
//! Samples runtime and host counters and reports them to a tally server.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tally_agent::{AgentArgs, AgentConfig, AgentFileConfig, Collector, Scheduler, build_transport};
use tally_core::MetricStore;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "tally-agent")]
#[command(about = "Periodic metrics agent")]
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
    /// Run the agent until interrupted
    Run(AgentArgs),

    /// Sample every source once and print the result
    Collect,

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "tally-agent.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("tally_agent=info".parse()?);
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
        Commands::Run(args) => run_agent(&args).await?,
        Commands::Collect => collect_once()?,
        Commands::InitConfig { output } => init_config(&output)?,
    }

    Ok(())
}

async fn run_agent(args: &AgentArgs) -> anyhow::Result<()> {
    let config = AgentConfig::load(args)?;
    info!(
        address = %config.address,
        transport = ?config.transport,
        signed = config.key.is_some(),
        encrypted = config.crypto_key.is_some(),
        "starting tally-agent"
    );

    let transport = build_transport(&config)?;
    let scheduler = Scheduler::new(
        (&config).into(),
        MetricStore::new(),
        Collector::with_defaults(),
        transport,
    );
    let handle = scheduler.handle();

    tokio::spawn(async move {
        shutdown_signal().await;
        handle.shutdown();
    });

    let stats = scheduler.run().await;
    info!(
        deliveries = stats.deliveries_started,
        failed = stats.deliveries_failed,
        dropped = stats.ticks_dropped,
        "tally-agent stopped"
    );
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

fn collect_once() -> anyhow::Result<()> {
    let store = MetricStore::new();
    let report = Collector::with_defaults().collect(&store);
    let snapshot = store.snapshot();

    println!("Counters:");
    for (name, value) in &snapshot.counters {
        println!("  {name:<24} {value}");
    }
    println!("Gauges:");
    for (name, value) in &snapshot.gauges {
        println!("  {name:<24} {}", tally_core::format_gauge(*value));
    }
    if report.failed > 0 {
        println!("\n{} source(s) failed, see log", report.failed);
    }
    Ok(())
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    let sample = serde_json::to_string_pretty(&AgentFileConfig::sample())?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, sample)?;
    println!("Config written to: {}", output.display());
    Ok(())
}
