use std::{
    path::PathBuf,
    sync::Arc,
};

use anchor_storage::{
    AnchoredStorage,
    Config,
    PersistOutcome,
};
use anchor_storage_core::{
    TimestampBoundaries,
    Transaction,
};
use anyhow::{
    Context,
    Result,
};
use clap::{
    Parser,
    Subcommand,
};
use tracing::{
    info,
    warn,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a file and anchor it on chain.
    Append { file: PathBuf },
    /// Read anchored content by id.
    Read { id: String },
    /// List content anchored between two unix timestamps.
    List {
        #[arg(long)]
        from: Option<u64>,
        #[arg(long)]
        to: Option<u64>,
    },
    /// Pin content on the IPFS node.
    Pin {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Read the transactions of a channel from the indexer.
    Channel { id: String },
    /// Persist a clear transaction to a channel and wait for the indexer.
    Persist {
        channel: String,
        data: String,
        #[arg(long, value_delimiter = ',')]
        topics: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(config.log_level.into())
                .from_env_lossy(),
        )
        .init();

    let storage = Arc::new(config.build_storage()?);

    tokio::select! {
        result = run(&config, storage, command) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted");
            Ok(())
        }
    }
}

async fn run(config: &Config, storage: Arc<AnchoredStorage>, command: Command) -> Result<()> {
    match command {
        Command::Append { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            storage.initialize().await?;
            let stored = storage.append(&content).await?;
            print_json(&stored.meta)?;
            println!("{}", stored.id);
        }
        Command::Read { id } => {
            let stored = storage.read(&id).await?;
            print_json(&stored.meta)?;
            println!("{}", stored.content);
        }
        Command::List { from, to } => {
            let boundaries = TimestampBoundaries::new(from, to);
            let ids = storage.get_data_ids(Some(boundaries)).await?;
            info!(count = ids.len(), "Listed anchored content");
            for id in ids {
                println!("{id}");
            }
        }
        Command::Pin { ids } => {
            let pinned = storage.pin(&ids, None).await?;
            for id in pinned {
                println!("{id}");
            }
        }
        Command::Channel { id } => {
            let access = config.build_data_access(storage)?;
            let channel = access.get_transactions_by_channel_id(&id, None).await?;
            for (location, transaction) in channel.locations.iter().zip(&channel.transactions) {
                println!("{location} {}", serde_json::to_string(transaction)?);
            }
        }
        Command::Persist {
            channel,
            data,
            topics,
        } => {
            let access = config.build_data_access(storage)?;
            access.initialize().await?;
            let handle = access
                .persist_transaction(Transaction::clear(data), &channel, topics)
                .await?;
            info!(location = %handle.location, "Waiting for the indexer");

            match handle.confirmation().await {
                PersistOutcome::Confirmed(result) => {
                    print_json(&result.storage_meta)?;
                    println!("{}", result.location);
                }
                PersistOutcome::Failed(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
