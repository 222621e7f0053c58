// ABOUTME: CLI entry point for table-replicator
// ABOUTME: Parses commands and routes to the sync and serve handlers

use clap::{Parser, Subcommand};
use table_replicator::commands;
use table_replicator::config::SettingsArgs;

#[derive(Parser)]
#[command(name = "table-replicator")]
#[command(about = "Incremental table-by-table PostgreSQL replication", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(flatten)]
    settings: SettingsArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate the given tables once, streaming events to stdout
    Sync {
        /// Tables to replicate (comma-separated, optionally schema.table)
        #[arg(long)]
        tables: String,
    },
    /// Run the worker pool with job submission and event stream listeners
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    // Events go to stdout; keep log lines on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = cli.settings.resolve()?;

    match cli.command {
        Commands::Sync { tables } => {
            commands::sync(settings, commands::sync::SyncOptions { tables }).await
        }
        Commands::Serve => commands::serve(settings).await,
    }
}
