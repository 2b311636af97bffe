mod commands;
mod fingerprint;
mod library;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use photosift_core::{AssetId, Decision, Engine, QueryIntent};
use tracing_subscriber::EnvFilter;

/// Photosift: find blurry shots, screenshots and near-duplicates in a photo library
#[derive(Parser)]
#[command(name = "photosift", version, about)]
struct Cli {
    /// Directory holding the catalog and analysis cache
    #[arg(long, env = "PHOTOSIFT_HOME", default_value_t = default_data_dir())]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a directory, analyze its photos and group near-duplicates
    Scan {
        /// Path to the photo directory
        path: PathBuf,
    },
    /// Show library totals
    Status,
    /// Show per-month aggregates, newest first
    Timeline,
    /// Page through one query intent
    ///
    /// Intents: all, month:YYYY-MM, similar, skipped-groups, large, blurred,
    /// documents, screenshots, pending, skipped, timeline, timeline:YYYY-MM,
    /// dashboard
    Feed {
        intent: QueryIntent,
        /// Number of pages to load
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
    /// Mark assets as clean, pending (deletion) or skipped
    Decide {
        decision: Decision,
        /// Asset ids as shown by `feed`
        #[arg(required = true)]
        ids: Vec<AssetId>,
    },
    /// List similarity groups, or show one group in detail
    Groups {
        /// Group ID (omit to list all)
        id: Option<String>,
    },
}

fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".photosift")
        .to_string_lossy()
        .to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("photosift=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let data_dir = PathBuf::from(&cli.data_dir);

    match cli.command {
        Commands::Scan { path } => commands::scan::run(&data_dir, path).await,
        Commands::Status => with_catalog(&data_dir, commands::status::run).await,
        Commands::Timeline => with_catalog(&data_dir, commands::timeline::run).await,
        Commands::Feed { intent, pages } => {
            with_catalog(&data_dir, |engine| commands::feed::run(engine, intent, pages)).await
        }
        Commands::Decide { decision, ids } => {
            with_catalog(&data_dir, |engine| commands::decide::run(engine, decision, ids)).await
        }
        Commands::Groups { id } => {
            with_catalog(&data_dir, |engine| commands::groups::run(engine, id)).await
        }
    }
}

/// Run a catalog-only command, then stop the engine cleanly.
async fn with_catalog(data_dir: &Path, command: impl FnOnce(&Engine) -> Result<()>) -> Result<()> {
    let engine = commands::open_catalog(data_dir);
    let outcome = command(&engine);
    engine.shutdown().await?;
    outcome
}
