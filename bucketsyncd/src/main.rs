use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bucketsyncd::daemon::{DaemonConfig, DaemonRuntime, local_tree};

/// Keeps a local directory in sync with an object store bucket.
#[derive(Debug, Parser)]
#[command(name = "bucketsyncd")]
#[command(version, about)]
struct Cli {
    /// Local root to sync; overrides BUCKETSYNC_ROOT
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Command {
    /// Watch the root and sync until interrupted (default)
    Run,
    /// Run one full pull pass, print the report and exit
    Sync,
    /// Print the current tree snapshot as JSON
    Tree,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = DaemonConfig::from_env()?;
    if let Some(root) = cli.root {
        config.sync_root = root;
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => DaemonRuntime::bootstrap(config).await?.run().await,
        Command::Sync => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            let result = daemon.service().force_sync().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                anyhow::bail!("sync failed");
            }
            Ok(())
        }
        Command::Tree => {
            let snapshot = local_tree(&config.sync_root).await?;
            println!("{}", serde_json::to_string_pretty(&*snapshot)?);
            Ok(())
        }
    }
}
