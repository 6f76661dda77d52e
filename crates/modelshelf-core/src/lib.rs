//! ModelShelf Core - headless cache, scanner and download engine for
//! image-generation model libraries.
//!
//! The engine catalogues model files (LoRAs, checkpoints, embeddings) by
//! content hash, keeps an ordered in-memory snapshot mirrored to a per-library
//! SQLite store, enriches records from metadata providers and downloads new
//! files with resumable, bounded-concurrency transfers.
//!
//! # Example
//!
//! ```rust,ignore
//! use modelshelf_core::{LibraryConfig, ModelKind, ScanMode, ShelfConfig, ShelfContext};
//! use modelshelf_core::cancel::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> modelshelf_core::Result<()> {
//!     let context = ShelfContext::builder(ShelfConfig::new("/var/lib/modelshelf"))
//!         .build()
//!         .await?;
//!     let library = context
//!         .activate_library(
//!             LibraryConfig::new("main").with_root("/models/loras", ModelKind::Lora),
//!         )
//!         .await?;
//!
//!     library.scan(ScanMode::Quick, &CancellationToken::new()).await?;
//!     for (hash, paths) in library.duplicate_groups() {
//!         println!("{}: {} copies", hash, paths.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod config;
pub mod download;
pub mod error;
pub mod hashing;
pub mod index;
pub mod library;
pub mod metadata;
pub mod network;
pub mod progress;
pub mod scanner;
pub mod store;
pub mod types;

mod context;

// Re-export commonly used types
pub use cache::{LibraryCache, TagCount};
pub use cancel::CancellationToken;
pub use config::{DownloadSettings, LibraryConfig, LibraryRoot, ProviderId, ShelfConfig};
pub use context::{ShelfContext, ShelfContextBuilder};
pub use download::{
    DownloadCoordinator, DownloadSnapshot, DownloadSource, DownloadState, StartOptions,
};
pub use error::{Result, ShelfError};
pub use index::HashIndex;
pub use library::{ModelLibrary, MutationOutcome, OrganizeReport, ReconcileReport, RefreshReport};
pub use metadata::{MetadataProvider, MetadataResolver, Resolution};
pub use progress::{OperationKind, ProgressBroadcaster, ProgressSnapshot, ProgressStatus};
pub use scanner::{FileScanner, ScanMode, ScanReport};
pub use store::PersistentStore;
pub use types::{
    ModelKind, ModelMetadata, ModelRecord, Page, RecordFilter, SortKey, SortOrder,
};
