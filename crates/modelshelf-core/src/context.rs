//! The process-wide engine context.
//!
//! Built once at start-up and passed to whatever drives the engine. Owns the
//! configuration, progress broadcaster, metadata resolver, download
//! coordinator and the single active library.

use crate::cancel::CancellationToken;
use crate::config::{LibraryConfig, ShelfConfig};
use crate::download::{
    DownloadCoordinator, DownloadPostProcessor, DownloadSnapshot, HttpTransferSource,
    TransferSource,
};
use crate::error::{Result, ShelfError};
use crate::library::ModelLibrary;
use crate::metadata::MetadataResolver;
use crate::progress::{ProgressBroadcaster, ProgressSnapshot};
use crate::types::ModelRecord;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Slot holding the active library, shared with the download post-processor.
#[derive(Clone, Default)]
struct ActiveLibrary(Arc<RwLock<Option<Arc<ModelLibrary>>>>);

impl ActiveLibrary {
    async fn current(&self) -> Option<Arc<ModelLibrary>> {
        self.0.read().await.clone()
    }
}

/// Catalogues finished downloads into whichever library is active.
struct LibraryIngest {
    active: ActiveLibrary,
    resolver: Arc<MetadataResolver>,
}

#[async_trait]
impl DownloadPostProcessor for LibraryIngest {
    async fn on_completed(&self, download: &DownloadSnapshot) -> Result<Option<ModelRecord>> {
        let Some(library) = self.active.current().await else {
            debug!("No active library; {} left uncatalogued", download.destination.display());
            return Ok(None);
        };
        if library.config().root_for(&download.destination).is_none() {
            debug!(
                "{} is outside library {}; not catalogued",
                download.destination.display(),
                library.name()
            );
            return Ok(None);
        }
        library
            .ingest_download(&download.destination, Some(&self.resolver))
            .await
            .map(Some)
    }
}

/// Builder for [`ShelfContext`].
///
/// ```rust,ignore
/// let context = ShelfContext::builder(ShelfConfig::new("/var/lib/modelshelf"))
///     .build()
///     .await?;
/// ```
pub struct ShelfContextBuilder {
    config: ShelfConfig,
    transfer_source: Option<Arc<dyn TransferSource>>,
    resolver: Option<MetadataResolver>,
}

impl ShelfContextBuilder {
    /// Replace the HTTP transfer source.
    pub fn transfer_source(mut self, source: Arc<dyn TransferSource>) -> Self {
        self.transfer_source = Some(source);
        self
    }

    /// Replace the resolver built from `provider_order`.
    pub fn resolver(mut self, resolver: MetadataResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub async fn build(self) -> Result<ShelfContext> {
        let config = self.config;
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(|e| ShelfError::Io {
            message: format!("Failed to create data directory: {}", config.data_dir.display()),
            path: Some(config.data_dir.clone()),
            source: Some(e),
        })?;

        let broadcaster = Arc::new(ProgressBroadcaster::new(config.progress_grace));
        let resolver = Arc::new(match self.resolver {
            Some(resolver) => resolver,
            None => MetadataResolver::from_config(&config)?,
        });
        let transfer_source: Arc<dyn TransferSource> = match self.transfer_source {
            Some(source) => source,
            None => Arc::new(HttpTransferSource::new()?),
        };

        let active = ActiveLibrary::default();
        let downloads = DownloadCoordinator::builder(transfer_source)
            .settings(config.downloads.clone())
            .broadcaster(broadcaster.clone())
            .persist_to(config.downloads_file())
            .post_processor(Arc::new(LibraryIngest {
                active: active.clone(),
                resolver: resolver.clone(),
            }))
            .build();

        let restored = downloads.restore_persisted().await;
        if restored > 0 {
            info!("Restored {} paused downloads", restored);
        }

        Ok(ShelfContext {
            config,
            broadcaster,
            resolver,
            active,
            downloads,
        })
    }
}

pub struct ShelfContext {
    config: ShelfConfig,
    broadcaster: Arc<ProgressBroadcaster>,
    resolver: Arc<MetadataResolver>,
    active: ActiveLibrary,
    downloads: DownloadCoordinator,
}

impl ShelfContext {
    pub fn builder(config: ShelfConfig) -> ShelfContextBuilder {
        ShelfContextBuilder {
            config,
            transfer_source: None,
            resolver: None,
        }
    }

    pub fn config(&self) -> &ShelfConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    pub fn resolver(&self) -> &Arc<MetadataResolver> {
        &self.resolver
    }

    pub fn downloads(&self) -> &DownloadCoordinator {
        &self.downloads
    }

    /// Latest progress for an operation id.
    pub fn progress(&self, op_id: &str) -> Option<ProgressSnapshot> {
        self.broadcaster.latest(op_id)
    }

    /// Make `library` the active one.
    ///
    /// The previous library is drained and closed first, releasing its store
    /// lock. If opening the new library fails no library is active. Unless
    /// disabled, the stored snapshot is reconciled against the disk before the
    /// library is published; a failed reconcile leaves the stored snapshot.
    pub async fn activate_library(&self, library: LibraryConfig) -> Result<Arc<ModelLibrary>> {
        let mut slot = self.active.0.write().await;
        if let Some(previous) = slot.take() {
            info!("Deactivating library {}", previous.name());
            previous.close().await?;
        }
        let opened = Arc::new(ModelLibrary::open(
            library,
            &self.config,
            self.broadcaster.clone(),
        )?);
        if opened.config().reconcile_on_open {
            if let Err(e) = opened.reconcile(false, &CancellationToken::new()).await {
                warn!("Reconcile of library {} failed: {}", opened.name(), e);
            }
        }
        *slot = Some(opened.clone());
        info!("Active library: {}", opened.name());
        Ok(opened)
    }

    pub async fn active_library(&self) -> Result<Arc<ModelLibrary>> {
        self.active
            .current()
            .await
            .ok_or_else(|| ShelfError::NotFound("no active library".into()))
    }

    /// Close the active library, if any.
    pub async fn deactivate_library(&self) -> Result<()> {
        let previous = self.active.0.write().await.take();
        if let Some(previous) = previous {
            previous.close().await?;
        }
        Ok(())
    }

    /// Pause running downloads (they persist for the next start) and close
    /// the active library.
    pub async fn shutdown(&self) -> Result<()> {
        let paused = self.downloads.pause_all().await;
        if paused > 0 {
            info!("Pausing {} downloads for shutdown", paused);
            for snapshot in self.downloads.list().await {
                self.downloads.wait_settled(&snapshot.id).await;
            }
        }
        self.deactivate_library().await
    }
}
