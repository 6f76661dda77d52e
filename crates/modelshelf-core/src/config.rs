//! Centralized configuration for ModelShelf.
//!
//! Fixed tuning values live on the `*Config` constant structs. Values a host
//! application may want to change at runtime are carried by [`ShelfConfig`]
//! and [`LibraryConfig`], which are built in code (settings-file loading is
//! the host's job) and handed to [`crate::ShelfContext`].

use crate::error::{Result, ShelfError};
use crate::network::RetryConfig;
use crate::types::{ModelKind, SortOrder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Filesystem scanning configuration.
pub struct ScanConfig;

impl ScanConfig {
    /// Read buffer for content hashing (8MB, optimal for SSDs).
    pub const HASH_CHUNK_SIZE: usize = 8 * 1024 * 1024;
    /// Files hashed concurrently during a scan.
    pub const HASH_CONCURRENCY: usize = 4;
    /// Progress is published every N files.
    pub const PROGRESS_EVERY: usize = 25;
    /// Suffix of in-flight download files, never catalogued.
    pub const PARTIAL_SUFFIX: &'static str = ".part";
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const USER_AGENT: &'static str = "modelshelf/0.1";
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Longest silence tolerated between two body chunks of a transfer.
    pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
    pub const CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
    pub const CIRCUIT_BREAKER_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);
}

/// Download coordinator configuration.
pub struct DownloadConfig;

impl DownloadConfig {
    pub const DEFAULT_CONCURRENCY: usize = 3;
    pub const MAX_ATTEMPTS: u32 = 5;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
    pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
    /// How long terminal jobs stay visible to `status` before collection.
    pub const TERMINAL_RETENTION: Duration = Duration::from_secs(600);
    pub const PERSISTENCE_FILENAME: &'static str = "downloads.json";
}

/// Metadata provider configuration.
pub struct ProviderConfig;

impl ProviderConfig {
    pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);
    pub const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(3600);
    pub const NEGATIVE_CACHE_CAPACITY: u64 = 50_000;
    pub const REMOTE_REQUESTS_PER_SECOND: u32 = 2;
    pub const CIVITAI_API_BASE: &'static str = "https://civitai.com/api/v1";
    pub const CIVARCHIVE_API_BASE: &'static str = "https://civarchive.com/api";
}

/// Progress broadcaster configuration.
pub struct ProgressConfig;

impl ProgressConfig {
    /// How long a terminal snapshot survives so one more poll succeeds.
    pub const TERMINAL_GRACE: Duration = Duration::from_secs(30);
    pub const CHANNEL_CAPACITY: usize = 256;
}

/// Persistent store configuration.
pub struct StoreConfig;

impl StoreConfig {
    pub const DB_FILENAME: &'static str = "library.db";
    pub const LOCK_FILENAME: &'static str = "library.lock";
    /// Saved library configuration (roots and sort order).
    pub const LIBRARY_FILENAME: &'static str = "library.json";
    pub const BUSY_TIMEOUT_MS: u32 = 30_000;
}

/// Metadata providers in the order they may be chained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    /// Local SQLite archive database.
    Archive,
    /// CivitAI REST API.
    Civitai,
    /// CivArchive REST API.
    CivArchive,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Archive => "archive",
            ProviderId::Civitai => "civitai",
            ProviderId::CivArchive => "civarchive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "archive" => Some(ProviderId::Archive),
            "civitai" => Some(ProviderId::Civitai),
            "civarchive" => Some(ProviderId::CivArchive),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Download coordinator settings.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Maximum concurrently running transfers (`K`).
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub read_timeout: Duration,
    pub progress_interval: Duration,
    pub terminal_retention: Duration,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            concurrency: DownloadConfig::DEFAULT_CONCURRENCY,
            retry: RetryConfig::new()
                .with_max_attempts(DownloadConfig::MAX_ATTEMPTS)
                .with_base_delay(DownloadConfig::RETRY_BASE_DELAY)
                .with_max_delay(DownloadConfig::RETRY_MAX_DELAY),
            read_timeout: NetworkConfig::READ_TIMEOUT,
            progress_interval: DownloadConfig::PROGRESS_INTERVAL,
            terminal_retention: DownloadConfig::TERMINAL_RETENTION,
        }
    }
}

/// Process-wide runtime configuration.
#[derive(Debug, Clone)]
pub struct ShelfConfig {
    /// Root of all engine state (stores, locks, persisted downloads).
    pub data_dir: PathBuf,
    pub downloads: DownloadSettings,
    pub provider_order: Vec<ProviderId>,
    pub provider_timeout: Duration,
    pub civitai_api_key: Option<String>,
    pub archive_db_path: Option<PathBuf>,
    pub progress_grace: Duration,
}

impl ShelfConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            downloads: DownloadSettings::default(),
            provider_order: vec![ProviderId::Archive, ProviderId::Civitai, ProviderId::CivArchive],
            provider_timeout: ProviderConfig::PROVIDER_TIMEOUT,
            civitai_api_key: None,
            archive_db_path: None,
            progress_grace: ProgressConfig::TERMINAL_GRACE,
        }
    }

    pub fn with_download_concurrency(mut self, concurrency: usize) -> Self {
        self.downloads.concurrency = concurrency;
        self
    }

    pub fn with_download_retry(mut self, retry: RetryConfig) -> Self {
        self.downloads.retry = retry;
        self
    }

    pub fn with_provider_order(mut self, order: Vec<ProviderId>) -> Self {
        self.provider_order = order;
        self
    }

    pub fn with_civitai_api_key(mut self, key: impl Into<String>) -> Self {
        self.civitai_api_key = Some(key.into());
        self
    }

    pub fn with_archive_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.archive_db_path = Some(path.into());
        self
    }

    pub fn with_progress_grace(mut self, grace: Duration) -> Self {
        self.progress_grace = grace;
        self
    }

    /// Directory holding the store and lock file of library `name`.
    pub fn library_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Path of the persisted download queue.
    pub fn downloads_file(&self) -> PathBuf {
        self.data_dir.join(DownloadConfig::PERSISTENCE_FILENAME)
    }

    pub fn validate(&self) -> Result<()> {
        if self.downloads.concurrency == 0 {
            return Err(ShelfError::Validation {
                field: "downloads.concurrency".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.downloads.retry.max_attempts == 0 {
            return Err(ShelfError::Validation {
                field: "downloads.retry.max_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// One scanned directory and the kind of model it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRoot {
    pub path: PathBuf,
    pub kind: ModelKind,
}

impl LibraryRoot {
    pub fn new(path: impl Into<PathBuf>, kind: ModelKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.path)
    }
}

pub(crate) fn deepest_root<'a>(roots: &'a [LibraryRoot], path: &Path) -> Option<&'a LibraryRoot> {
    roots
        .iter()
        .filter(|root| root.contains(path))
        .max_by_key(|root| root.path.components().count())
}

/// A named set of root directories.
///
/// Roots given when a library is opened replace the saved set; an empty root
/// list reuses the saved one. Records outside a new root set are dropped by
/// the next scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub name: String,
    pub roots: Vec<LibraryRoot>,
    #[serde(default)]
    pub sort: SortOrder,
    /// Reconcile against the disk when the library is activated.
    #[serde(default = "default_reconcile_on_open")]
    pub reconcile_on_open: bool,
}

fn default_reconcile_on_open() -> bool {
    true
}

impl LibraryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roots: Vec::new(),
            sort: SortOrder::default(),
            reconcile_on_open: true,
        }
    }

    pub fn with_root(mut self, path: impl Into<PathBuf>, kind: ModelKind) -> Self {
        self.roots.push(LibraryRoot::new(path, kind));
        self
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_reconcile_on_open(mut self, reconcile: bool) -> Self {
        self.reconcile_on_open = reconcile;
        self
    }

    /// The root owning `path`; the deepest match wins for nested roots.
    pub fn root_for(&self, path: &Path) -> Option<&LibraryRoot> {
        deepest_root(&self.roots, path)
    }

    /// Names double as directory names under the data dir.
    pub fn validate_name(&self) -> Result<()> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_name {
            return Err(ShelfError::Validation {
                field: "library.name".into(),
                message: format!("'{}' must be non-empty [A-Za-z0-9_-]", self.name),
            });
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_name()?;
        if self.roots.is_empty() {
            return Err(ShelfError::Validation {
                field: "library.roots".into(),
                message: "at least one root directory is required".into(),
            });
        }
        Ok(())
    }
}
