use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use ytstats_store::Store;
use ytstats_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "ytstats")]
#[command(about = "YouTube research corpus ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or update the store schema.
    Migrate,
    /// Merge a collector payload dump into the store.
    Ingest {
        #[arg(long)]
        input: PathBuf,
    },
    /// List monitored channels due for re-collection.
    Due,
    /// Cascade-delete a channel and everything under it.
    Purge {
        #[arg(long)]
        channel: String,
    },
    /// Run the periodic refresh check until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let store = Store::open(&config.database_path).await?;
            store.migrate().await?;
            println!("store ready at {}", config.database_path.display());
        }
        Commands::Ingest { input } => {
            let summary = ytstats_sync::ingest_batch_file(&config, &input).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Due => {
            for channel_id in ytstats_sync::report_due_channels(&config).await? {
                println!("{channel_id}");
            }
        }
        Commands::Purge { channel } => {
            let store = Store::open(&config.database_path).await?;
            store.migrate().await?;
            if store.delete_channel(&channel).await? {
                println!("deleted channel {channel} and its videos and comments");
            } else {
                println!("no channel {channel} in store");
            }
        }
        Commands::Watch => match ytstats_sync::maybe_build_scheduler(&config).await? {
            Some(mut sched) => {
                sched.start().await?;
                tokio::signal::ctrl_c().await?;
            }
            None => {
                eprintln!("scheduler disabled; set YTSTATS_SCHEDULER_ENABLED=1");
            }
        },
    }

    Ok(())
}
