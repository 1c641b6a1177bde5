//! Petrel Inspect - Storage node volume inspection
//!
//! Opens a storage node's volume roots directly and prints the block
//! report, per-volume usage, or the health-check result. Run it against
//! a stopped node only: opening the volumes resets their staging
//! directories, exactly as node startup does.

use anyhow::Result;
use clap::{Parser, Subcommand};
use petrel_common::StorageConfig;
use petrel_storage::BlockStore;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "petrel-inspect")]
#[command(about = "Petrel storage node volume inspection")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/petrel/node.toml")]
    config: String,

    /// Volume root directories (override the config file)
    #[arg(long)]
    data_dirs: Vec<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print every block on disk, sorted by id
    Report {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print capacity and free space, per volume and in aggregate
    Usage,
    /// Verify every volume directory is present and writable
    Health,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    storage: StorageConfig,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file if it exists
    let config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {}", e);
            Config::default()
        })
    } else {
        Config::default()
    };

    // Merge CLI args with config file (CLI takes precedence)
    let mut storage = config.storage;
    if !args.data_dirs.is_empty() {
        storage.data_dirs = args.data_dirs.clone();
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(config = %args.config, volumes = storage.data_dirs.len(), "opening volumes");
    let store = BlockStore::open(&storage)?;

    match args.command {
        Commands::Report { json } => report(&store, json),
        Commands::Usage => usage(&store),
        Commands::Health => health(&store),
    }
}

fn report(store: &BlockStore, json: bool) -> Result<()> {
    let blocks = store.block_report()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&blocks)?);
    } else {
        for block in &blocks {
            println!("{block}\t{} bytes", block.num_bytes());
        }
        println!("{} blocks", blocks.len());
    }
    Ok(())
}

fn usage(store: &BlockStore) -> Result<()> {
    for volume in store.volume_usage()? {
        println!(
            "{}\tcapacity {}\tavailable {}\tmount {}",
            volume.root.display(),
            volume.capacity,
            volume.available,
            volume.mount
        );
    }
    println!("total capacity {}", store.capacity()?);
    println!("total remaining {}", store.remaining()?);
    Ok(())
}

fn health(store: &BlockStore) -> Result<()> {
    match store.check_health() {
        Ok(()) => {
            println!("ok: {} volumes healthy", store.volume_count());
            Ok(())
        }
        Err(e) => {
            eprintln!("unhealthy: {e}");
            std::process::exit(1);
        }
    }
}
