//! Batch surface for the master data pipeline.
//!
//! Usage:
//!   mdx-sync sync [--force]
//!   mdx-sync search <query> [--limit N]
//!   mdx-sync status
//!   mdx-sync clear

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mdx_data::{ConfigOverrides, MasterDataConfig, MasterDataService, StoreBackend};
use tracing::info;

#[derive(Parser)]
#[command(name = "mdx-sync")]
#[command(about = "Download, index and query instrument master data")]
struct Cli {
    /// JSON configuration file; MDX_* environment variables are used otherwise
    #[arg(long, global = true, env = "MDX_CONFIG")]
    config: Option<PathBuf>,

    /// Persistent store backend: json or sqlite
    #[arg(long, global = true)]
    backend: Option<StoreBackend>,

    #[arg(long, global = true)]
    store_path: Option<PathBuf>,

    /// Read master CSVs from this directory instead of the remote catalog
    #[arg(long, global = true)]
    source_dir: Option<PathBuf>,

    /// Keep a copy of every downloaded CSV here
    #[arg(long, global = true)]
    archive_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the index (skipped while the persisted one is fresh)
    Sync {
        /// Rebuild even if the persisted index is fresh
        #[arg(long)]
        force: bool,
    },
    /// Prefix search over trading symbols
    Search {
        query: String,
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },
    /// Print the status snapshot as JSON
    Status,
    /// Remove the persisted index
    Clear,
}

fn load_config(cli: &Cli) -> Result<MasterDataConfig> {
    let base = match &cli.config {
        Some(path) => MasterDataConfig::read_file(path)?,
        None => MasterDataConfig::read_vars(|key| std::env::var(key).ok())?,
    };

    let overrides = ConfigOverrides {
        backend: cli.backend,
        store_path: cli.store_path.clone(),
        source_dir: cli.source_dir.clone(),
        archive_dir: cli.archive_dir.clone(),
    };
    Ok(overrides.apply(base)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli).context("loading configuration")?;
    info!("Store: {:?} at {}", config.store.backend, config.store.path.display());

    let service = MasterDataService::from_config(config)?;

    match cli.command {
        Commands::Sync { force } => {
            let index = if force {
                service.sync_now().await?
            } else {
                service.ensure_loaded().await?
            };

            match service.status().last_report {
                Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                None => println!(
                    "Index is fresh: {} symbols built at {}",
                    index.len(),
                    index.built_at()
                ),
            }
        }
        Commands::Search { query, limit } => {
            service.ensure_loaded().await?;
            for record in service.search(&query, limit) {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    record.symbol,
                    record.token,
                    record.exchange,
                    record.option_type,
                    record.strike_price,
                    record.lot_size
                );
            }
        }
        Commands::Status => {
            service.load_from_store().await;
            println!("{}", serde_json::to_string_pretty(&service.status())?);
        }
        Commands::Clear => {
            service.clear_cache().await?;
            println!("Cleared master data cache");
        }
    }

    Ok(())
}
