//! Overseer binary

use clap::{Parser, Subcommand};
use overseer::{common::parse_duration, Overseer, OverseerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "overseer")]
#[command(about = "Cluster overseer: task locking, shard fan-out and async reconciliation")]
#[command(version)]
struct Cli {
    /// Config file layered over overseer.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the overseer server
    Serve {
        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for the admin HTTP API
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Admin handler path on members
        #[arg(long)]
        admin_path: Option<String>,

        /// Maximum number of tasks running at once
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Bound on the wait for async completion markers (e.g. "15s")
        #[arg(long, value_parser = parse_cli_duration)]
        async_wait: Option<Duration>,
    },
}

fn parse_cli_duration(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = OverseerConfig::load_from(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            admin_path,
            max_parallel,
            async_wait,
        } => {
            // CLI flags take priority over file and environment values
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(admin_path) = admin_path {
                config.admin_path = admin_path;
            }
            if let Some(max_parallel) = max_parallel {
                config.max_parallel_tasks = max_parallel;
            }
            if let Some(async_wait) = async_wait {
                config.async_wait_timeout_ms = u64::try_from(async_wait.as_millis()).unwrap_or(u64::MAX);
            }

            Overseer::new(config).serve().await?;
        }
    }

    Ok(())
}
