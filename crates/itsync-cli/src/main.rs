use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use itsync_sync::RunOptions;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "itsync")]
#[command(about = "Sync tracker issues and pull requests into a tabular store")]
struct Cli {
    /// Rules file (engineers, project names, title prefix); overrides ITSYNC_RULES.
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, diff and write to the store.
    Sync {
        /// Compute the create/replace split without writing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Same as `sync --dry-run`.
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .try_init();

    let cli = Cli::parse();
    let dry_run = match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => dry_run,
        Commands::Plan => true,
    };

    let summary = itsync_sync::run_sync_once_from_env(RunOptions {
        dry_run,
        rules_path: cli.rules,
    })
    .await?;

    println!(
        "sync complete: run_id={} dry_run={} fetched={} indexed={} to_create={} to_update={} created={} updated={}",
        summary.run_id,
        summary.dry_run,
        summary.fetched_issues,
        summary.indexed_rows,
        summary.to_create,
        summary.to_update,
        summary.dispatch.created,
        summary.dispatch.updated
    );

    Ok(())
}
