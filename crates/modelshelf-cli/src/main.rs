//! ModelShelf CLI - drive the library engine from a terminal.
//!
//! Results are printed to stdout as JSON; logs go to stderr.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modelshelf_core::{LibraryConfig, LibraryRoot, ModelKind, ShelfConfig, ShelfContext};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "modelshelf")]
#[command(about = "Catalogue, deduplicate and download image-generation models")]
struct Args {
    /// Engine state directory (stores, locks, persisted downloads)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Library name
    #[arg(short, long, global = true, default_value = "default")]
    library: String,

    /// Library root as KIND=PATH (kind: lora, checkpoint, embedding). Repeatable.
    /// Replaces the library's saved roots; omit to reuse them.
    #[arg(long = "root", global = true, value_parser = parse_root)]
    roots: Vec<LibraryRoot>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Maximum concurrent downloads
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// CivitAI API key for metadata lookups and gated downloads
    #[arg(long, global = true)]
    civitai_key: Option<String>,

    /// Local metadata archive (SQLite)
    #[arg(long, global = true)]
    archive_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk the roots and update the catalogue
    Scan {
        /// Rehash every file instead of trusting size and mtime
        #[arg(long)]
        full: bool,
    },
    /// Compare disk against the catalogue; scan only on drift
    Reconcile {
        /// Always run a full scan
        #[arg(long)]
        force: bool,
    },
    /// List records, one page at a time
    List {
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long, default_value = "50")]
        limit: usize,
        /// Substring of the display or file name
        #[arg(short, long)]
        search: Option<String>,
        /// Required tag. Repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Accepted base model. Repeatable.
        #[arg(long = "base-model")]
        base_models: Vec<String>,
        #[arg(long)]
        favorites: bool,
        /// Sort order, e.g. `name`, `date:desc`, `size`
        #[arg(long)]
        sort: Option<String>,
    },
    /// Files sharing a content hash
    Duplicates,
    /// Different files sharing a file name
    Conflicts,
    /// Most used tags
    Tags {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Distinct base models in the catalogue
    BaseModels,
    /// Look up metadata for a SHA-256 hash
    Resolve { hash: String },
    /// Fetch metadata for every record that has none
    Refresh,
    /// Move records into per-base-model folders
    Organize,
    /// Download a file, cataloguing it if it lands inside a root
    Download {
        url: String,
        destination: PathBuf,
        /// Expected SHA-256 of the finished file
        #[arg(long)]
        sha256: Option<String>,
        /// Replace an existing destination
        #[arg(long)]
        overwrite: bool,
        /// Send the CivitAI key as a bearer token
        #[arg(long)]
        authenticated: bool,
    },
    /// Resume a paused or failed download
    Resume { id: String },
    /// Cancel a download and delete its partial file
    Cancel { id: String },
    /// Persisted and in-flight downloads
    Downloads,
    /// Delete files and their records
    Delete {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

impl Command {
    fn needs_library(&self) -> bool {
        !matches!(
            self,
            Command::Resolve { .. }
                | Command::Download { .. }
                | Command::Resume { .. }
                | Command::Cancel { .. }
                | Command::Downloads
        )
    }

    /// Commands that scan on their own skip the reconcile on activation.
    fn scans_itself(&self) -> bool {
        matches!(self, Command::Scan { .. } | Command::Reconcile { .. })
    }
}

fn parse_root(s: &str) -> std::result::Result<LibraryRoot, String> {
    let (kind, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KIND=PATH, got '{}'", s))?;
    let kind = ModelKind::parse(kind).ok_or_else(|| format!("unknown model kind '{}'", kind))?;
    Ok(LibraryRoot::new(path, kind))
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("modelshelf"))
        .unwrap_or_else(|| PathBuf::from(".modelshelf"))
}

fn shelf_config(args: &Args) -> ShelfConfig {
    let mut config = ShelfConfig::new(args.data_dir.clone().unwrap_or_else(default_data_dir));
    if let Some(concurrency) = args.concurrency {
        config = config.with_download_concurrency(concurrency);
    }
    if let Some(key) = &args.civitai_key {
        config = config.with_civitai_api_key(key.clone());
    }
    if let Some(path) = &args.archive_db {
        config = config.with_archive_db(path.clone());
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = shelf_config(&args);
    info!("Data directory: {}", config.data_dir.display());
    let context = ShelfContext::builder(config)
        .build()
        .await
        .context("Failed to start the engine")?;

    let mut library =
        LibraryConfig::new(&args.library).with_reconcile_on_open(!args.command.scans_itself());
    library.roots = args.roots.clone();
    if args.command.needs_library() || !library.roots.is_empty() {
        context
            .activate_library(library)
            .await
            .with_context(|| format!("Failed to open library '{}'", args.library))?;
    }

    let result = commands::run(&context, args.command, args.civitai_key.as_deref()).await;
    context.shutdown().await?;
    result
}
