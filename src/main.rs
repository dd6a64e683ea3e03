use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bkfleet::config::AppConfig;
use bkfleet::context::AppContext;
use bkfleet::core::Orchestrator;
use bkfleet::logging::{self, LogConfig};
use bkfleet::rpc::{RpcClient, RpcServer};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "bkfleet")]
#[command(about = "Scheduled network backups for a fleet of devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Daemon control address
    #[arg(long, global = true, default_value = "127.0.0.1:7373")]
    rpc: SocketAddr,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backup daemon
    Daemon(ServerArgs),
    /// Show daemon health
    Status,
    /// List recent jobs, newest first
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a single job
    Job { id: String },
    /// Start a backup now
    Trigger {
        device: String,
        #[arg(long)]
        share: Option<String>,
    },
    /// Cancel a running or queued job
    Cancel { id: String },
    /// Reload the inventory and re-register triggers
    Reschedule,
    /// Resume scheduling after the repository filled up
    Resume,
    /// List registered triggers and pending retries
    Schedule,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    inventory_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    execution_log: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrent_backups: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = RpcClient::new(cli.rpc);
    let result: Value = match cli.command {
        Commands::Daemon(args) => {
            let config = AppConfig::new(cli.config.as_deref(), Some(&args))?;
            return run_daemon(config).await.context("Daemon failed");
        }
        Commands::Status => client.call("daemon.status", None).await?,
        Commands::Jobs { limit } => client.call("jobs.list", Some(json!({ "limit": limit }))).await?,
        Commands::Job { id } => client.call("jobs.get", Some(json!({ "id": id }))).await?,
        Commands::Trigger { device, share } => {
            client
                .call("backups.trigger", Some(json!({ "device": device, "share": share })))
                .await?
        }
        Commands::Cancel { id } => client.call("jobs.cancel", Some(json!({ "id": id }))).await?,
        Commands::Reschedule => client.call("schedule.reload", None).await?,
        Commands::Resume => client.call("schedule.resume", None).await?,
        Commands::Schedule => client.call("schedule.list", None).await?,
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    })?;

    let rpc_bind = config.rpc_bind;
    let ctx = AppContext::from_config(config).await?;
    let orchestrator = Orchestrator::new(ctx);
    orchestrator.start().await?;

    let server = RpcServer::bind(orchestrator.clone(), rpc_bind)
        .await
        .with_context(|| format!("Failed to bind control socket on {}", rpc_bind))?;

    let shutdown = CancellationToken::new();
    let rpc_shutdown = shutdown.clone();
    let rpc = tokio::spawn(async move { server.run(rpc_shutdown).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    shutdown.cancel();
    orchestrator.shutdown().await;
    match rpc.await {
        Ok(Err(e)) => error!(error = %e, "RPC server failed"),
        Err(e) => error!(error = %e, "RPC server task panicked"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
