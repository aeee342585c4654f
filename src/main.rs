use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "shopfloor")]
#[command(version, about = "Machine phase tracking and time accounting")]
pub struct Cli {
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show cached phase timing
    Status {
        /// Only show accumulators for this order
        #[arg(long)]
        order: Option<String>,
    },
    /// Run the configured machine session, printing phase changes and live elapsed time
    Run {
        /// Assign this order and begin setup after restoring
        #[arg(long)]
        assign: Option<String>,
        /// Stop after this many seconds instead of waiting for Ctrl+C
        #[arg(long)]
        for_secs: Option<u64>,
    },
    /// Run a scripted two-session scenario against an in-memory store
    Simulate {
        /// Operator for both sessions
        #[arg(long, default_value = "op-7")]
        operator: String,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default shopfloor.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    shopfloor::telemetry::init_tracing(cli.json_logs);
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Status { order } => cmd::cmd_status(&project_dir, order.as_deref())?,
        Commands::Run { assign, for_secs } => {
            cmd::cmd_run(&project_dir, assign.as_deref(), *for_secs).await?
        }
        Commands::Simulate { operator } => cmd::cmd_simulate(&project_dir, operator).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
