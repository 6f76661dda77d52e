//! Download coordinator scenarios driven by an in-memory transfer source.

mod common;

use async_trait::async_trait;
use common::{eventually, FixedProvider, MemorySource};
use modelshelf_core::download::{
    DownloadPostProcessor, TransferRequest, TransferResponse, TransferSource,
};
use modelshelf_core::network::RetryConfig;
use modelshelf_core::{
    DownloadCoordinator, DownloadSettings, DownloadSnapshot, DownloadSource, DownloadState,
    LibraryConfig, MetadataResolver, ModelKind, ModelRecord, Result, ShelfConfig, ShelfContext,
    ShelfError, StartOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use url::Url;

fn body() -> Vec<u8> {
    (0u8..64).collect()
}

fn coordinator(source: Arc<dyn TransferSource>, concurrency: usize) -> DownloadCoordinator {
    DownloadCoordinator::builder(source)
        .settings(DownloadSettings {
            concurrency,
            progress_interval: Duration::ZERO,
            ..Default::default()
        })
        .build()
}

fn part_of(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn mem(name: &str) -> DownloadSource {
    DownloadSource::new(format!("mem://models/{}", name))
}

async fn wait_for_bytes(downloads: &DownloadCoordinator, id: &str, bytes: u64) {
    eventually(move || async move {
        downloads
            .status(id)
            .await
            .is_some_and(|s| s.received_bytes == bytes)
    })
    .await;
}

async fn pause_at(
    downloads: &DownloadCoordinator,
    gate: &Semaphore,
    destination: &Path,
    chunks: usize,
) -> String {
    let id = downloads
        .start(mem("model.safetensors"), destination, StartOptions::default())
        .await
        .unwrap();
    gate.add_permits(chunks);
    wait_for_bytes(downloads, &id, chunks as u64 * 8).await;
    downloads.pause(&id).await.unwrap();
    let paused = downloads.wait_settled(&id).await.unwrap();
    assert_eq!(paused.state, DownloadState::Paused);
    id
}

#[tokio::test]
async fn test_resume_continues_from_partial() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(MemorySource::new(body()).with_gate(gate.clone()));
    let downloads = coordinator(source.clone(), 2);
    let destination = temp.path().join("loras/model.safetensors");

    let id = pause_at(&downloads, &gate, &destination, 3).await;
    assert_eq!(std::fs::metadata(part_of(&destination)).unwrap().len(), 24);
    assert!(!destination.exists());

    gate.add_permits(100);
    downloads.resume(&id).await.unwrap();
    let done = downloads.wait_settled(&id).await.unwrap();

    assert_eq!(done.state, DownloadState::Completed);
    assert_eq!(done.received_bytes, 64);
    assert_eq!(source.served_offsets(), vec![0, 24]);
    assert_eq!(std::fs::read(&destination).unwrap(), body());
    assert!(!part_of(&destination).exists());
}

#[tokio::test]
async fn test_resume_restarts_without_range_support() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(
        MemorySource::new(body())
            .without_ranges()
            .with_gate(gate.clone()),
    );
    let downloads = coordinator(source.clone(), 2);
    let destination = temp.path().join("model.safetensors");

    let id = pause_at(&downloads, &gate, &destination, 2).await;

    gate.add_permits(100);
    downloads.resume(&id).await.unwrap();
    let done = downloads.wait_settled(&id).await.unwrap();

    assert_eq!(done.state, DownloadState::Completed);
    assert_eq!(source.served_offsets(), vec![0, 0]);
    assert_eq!(std::fs::read(&destination).unwrap(), body());
}

#[tokio::test]
async fn test_concurrency_limit_leaves_extra_job_queued() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(MemorySource::new(body()).with_gate(gate.clone()));
    let downloads = coordinator(source, 2);

    let mut ids = Vec::new();
    for i in 0..3 {
        let destination = temp.path().join(format!("model-{}.safetensors", i));
        ids.push(
            downloads
                .start(mem("model.safetensors"), destination, StartOptions::default())
                .await
                .unwrap(),
        );
    }

    let watched = &downloads;
    let count = move |state: DownloadState| async move {
        watched
            .list()
            .await
            .iter()
            .filter(|s| s.state == state)
            .count()
    };
    eventually(move || async move {
        count(DownloadState::Downloading).await == 2 && count(DownloadState::Queued).await == 1
    })
    .await;

    let listed = downloads.list().await;
    let queued = listed
        .iter()
        .find(|s| s.state == DownloadState::Queued)
        .unwrap()
        .id
        .clone();
    let running = listed
        .iter()
        .find(|s| s.state == DownloadState::Downloading)
        .unwrap()
        .id
        .clone();

    downloads.cancel(&running).await.unwrap();
    let cancelled = downloads.wait_settled(&running).await.unwrap();
    assert_eq!(cancelled.state, DownloadState::Cancelled);

    let queued_id = queued.as_str();
    eventually(move || async move {
        watched
            .status(queued_id)
            .await
            .is_some_and(|s| s.state == DownloadState::Downloading)
    })
    .await;

    gate.add_permits(1000);
    for id in ids.iter().filter(|id| **id != running) {
        let done = downloads.wait_settled(id).await.unwrap();
        assert_eq!(done.state, DownloadState::Completed);
    }
}

#[tokio::test]
async fn test_cancel_paused_removes_partial_and_frees_destination() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(MemorySource::new(body()).with_gate(gate.clone()));
    let downloads = coordinator(source, 1);
    let destination = temp.path().join("model.safetensors");

    let id = pause_at(&downloads, &gate, &destination, 2).await;
    assert_eq!(std::fs::metadata(part_of(&destination)).unwrap().len(), 16);

    let cancelled = downloads.cancel(&id).await.unwrap();
    assert_eq!(cancelled.state, DownloadState::Cancelled);
    assert!(!part_of(&destination).exists());

    // Cancelling twice is a no-op
    assert_eq!(
        downloads.cancel(&id).await.unwrap().state,
        DownloadState::Cancelled
    );

    let again = downloads
        .start(mem("model.safetensors"), &destination, StartOptions::default())
        .await
        .unwrap();
    gate.add_permits(100);
    let done = downloads.wait_settled(&again).await.unwrap();
    assert_eq!(done.state, DownloadState::Completed);
    assert!(matches!(
        downloads.cancel(&again).await,
        Err(ShelfError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_destination_held_by_running_job() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(MemorySource::new(body()).with_gate(gate.clone()));
    let downloads = coordinator(source, 2);
    let destination = temp.path().join("model.safetensors");

    let id = downloads
        .start(mem("model.safetensors"), &destination, StartOptions::default())
        .await
        .unwrap();
    let duplicate = downloads
        .start(mem("model.safetensors"), &destination, StartOptions::default())
        .await;
    assert!(matches!(duplicate, Err(ShelfError::Conflict(_))));

    downloads.cancel(&id).await.unwrap();
    let cancelled = downloads.wait_settled(&id).await.unwrap();
    assert_eq!(cancelled.state, DownloadState::Cancelled);
    assert_eq!(cancelled.received_bytes, 0);
    assert!(!part_of(&destination).exists());
}

/// Fails the first `failures` opens with a transient network error.
struct FlakySource {
    inner: MemorySource,
    failures: u32,
    opens: AtomicU32,
}

#[async_trait]
impl TransferSource for FlakySource {
    fn supports(&self, url: &Url) -> bool {
        self.inner.supports(url)
    }

    async fn open(&self, request: &TransferRequest) -> Result<TransferResponse> {
        if self.opens.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(ShelfError::Network {
                message: "connection reset".into(),
                cause: None,
            });
        }
        self.inner.open(request).await
    }
}

fn flaky_coordinator(failures: u32, max_attempts: u32) -> (Arc<FlakySource>, DownloadCoordinator) {
    let source = Arc::new(FlakySource {
        inner: MemorySource::new(body()),
        failures,
        opens: AtomicU32::new(0),
    });
    let downloads = DownloadCoordinator::builder(source.clone())
        .settings(DownloadSettings {
            concurrency: 1,
            retry: RetryConfig::new()
                .with_max_attempts(max_attempts)
                .with_base_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(20))
                .with_jitter(false),
            ..Default::default()
        })
        .build();
    (source, downloads)
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let temp = TempDir::new().unwrap();
    let (source, downloads) = flaky_coordinator(2, 3);
    let destination = temp.path().join("model.safetensors");

    let id = downloads
        .start(mem("model.safetensors"), &destination, StartOptions::default())
        .await
        .unwrap();
    let done = downloads.wait_settled(&id).await.unwrap();

    assert_eq!(done.state, DownloadState::Completed);
    assert_eq!(done.attempts, 3);
    assert_eq!(source.opens.load(Ordering::SeqCst), 3);
    assert_eq!(std::fs::read(&destination).unwrap(), body());
}

#[tokio::test]
async fn test_exhausted_retries_fail_and_keep_destination() {
    let temp = TempDir::new().unwrap();
    let (_source, downloads) = flaky_coordinator(10, 2);
    let destination = temp.path().join("model.safetensors");

    let id = downloads
        .start(mem("model.safetensors"), &destination, StartOptions::default())
        .await
        .unwrap();
    let failed = downloads.wait_settled(&id).await.unwrap();
    assert_eq!(failed.state, DownloadState::Failed);
    assert_eq!(failed.error_kind.as_deref(), Some("network"));
    assert_eq!(failed.attempts, 2);

    let blocked = downloads
        .start(mem("model.safetensors"), &destination, StartOptions::default())
        .await;
    assert!(matches!(blocked, Err(ShelfError::Conflict(_))));

    downloads.cancel(&id).await.unwrap();
    assert!(downloads
        .start(mem("model.safetensors"), &destination, StartOptions::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_paused_download_survives_restart() {
    let temp = TempDir::new().unwrap();
    let shelf = ShelfConfig::new(temp.path().join("data"));
    let destination = temp.path().join("model.safetensors");

    let id = {
        let gate = Arc::new(Semaphore::new(0));
        let context = ShelfContext::builder(shelf.clone())
            .transfer_source(Arc::new(MemorySource::new(body()).with_gate(gate.clone())))
            .resolver(MetadataResolver::new(Duration::from_secs(1)))
            .build()
            .await
            .unwrap();
        let id = context
            .downloads()
            .start(mem("model.safetensors"), &destination, StartOptions::default())
            .await
            .unwrap();
        gate.add_permits(2);
        wait_for_bytes(context.downloads(), &id, 16).await;
        context.shutdown().await.unwrap();
        assert_eq!(
            context.downloads().status(&id).await.unwrap().state,
            DownloadState::Paused
        );
        id
    };

    let source = Arc::new(MemorySource::new(body()));
    let context = ShelfContext::builder(shelf)
        .transfer_source(source.clone())
        .resolver(MetadataResolver::new(Duration::from_secs(1)))
        .build()
        .await
        .unwrap();

    let restored = context.downloads().status(&id).await.unwrap();
    assert_eq!(restored.state, DownloadState::Paused);
    assert_eq!(restored.received_bytes, 16);

    context.downloads().resume(&id).await.unwrap();
    let done = context.downloads().wait_settled(&id).await.unwrap();
    assert_eq!(done.state, DownloadState::Completed);
    assert_eq!(source.served_offsets(), vec![16]);
    assert_eq!(std::fs::read(&destination).unwrap(), body());
}

#[tokio::test]
async fn test_completed_download_is_catalogued() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("loras");
    std::fs::create_dir_all(&root).unwrap();
    let resolver = MetadataResolver::new(Duration::from_secs(1))
        .with_provider(Arc::new(FixedProvider::named("Downloaded Style", "SDXL 1.0")));
    let context = ShelfContext::builder(ShelfConfig::new(temp.path().join("data")))
        .transfer_source(Arc::new(MemorySource::new(body())))
        .resolver(resolver)
        .build()
        .await
        .unwrap();
    let library = context
        .activate_library(LibraryConfig::new("main").with_root(&root, ModelKind::Lora))
        .await
        .unwrap();

    let inside = root.join("style.safetensors");
    let id = context
        .downloads()
        .start(mem("style.safetensors"), &inside, StartOptions::default())
        .await
        .unwrap();
    let done = context.downloads().wait_settled(&id).await.unwrap();
    assert_eq!(done.state, DownloadState::Completed);

    let record = library.by_path(&inside).unwrap();
    assert_eq!(done.record_hash.as_deref(), Some(record.hash.as_str()));
    assert_eq!(record.display_name, "Downloaded Style");
    assert_eq!(library.base_models(), vec!["SDXL 1.0".to_string()]);

    // Outside every root: downloaded but not catalogued
    let outside = temp.path().join("elsewhere/other.safetensors");
    let id = context
        .downloads()
        .start(mem("other.safetensors"), &outside, StartOptions::default())
        .await
        .unwrap();
    let done = context.downloads().wait_settled(&id).await.unwrap();
    assert_eq!(done.state, DownloadState::Completed);
    assert!(done.record_hash.is_none());
    assert!(outside.exists());
    assert_eq!(library.snapshot().len(), 1);
}

/// Serves a new etag from the second open on, as if the file was replaced
/// upstream between connections.
struct ReplacedSource {
    inner: MemorySource,
    opens: AtomicU32,
}

#[async_trait]
impl TransferSource for ReplacedSource {
    fn supports(&self, url: &Url) -> bool {
        self.inner.supports(url)
    }

    async fn open(&self, request: &TransferRequest) -> Result<TransferResponse> {
        let mut response = self.inner.open(request).await?;
        if self.opens.fetch_add(1, Ordering::SeqCst) > 0 {
            response.identity.etag = Some("\"v2\"".into());
        }
        Ok(response)
    }
}

#[tokio::test]
async fn test_resume_restarts_when_remote_changed() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let source = Arc::new(ReplacedSource {
        inner: MemorySource::new(body()).with_gate(gate.clone()),
        opens: AtomicU32::new(0),
    });
    let downloads = coordinator(source.clone(), 1);
    let destination = temp.path().join("model.safetensors");

    let id = pause_at(&downloads, &gate, &destination, 2).await;

    gate.add_permits(100);
    downloads.resume(&id).await.unwrap();
    let done = downloads.wait_settled(&id).await.unwrap();

    assert_eq!(done.state, DownloadState::Completed);
    assert_eq!(done.received_bytes, 64);
    assert_eq!(source.inner.served_offsets(), vec![0, 16, 0]);
    assert_eq!(std::fs::read(&destination).unwrap(), body());
}

/// Holds the job in post-processing for `delay`.
struct SlowIngest {
    delay: Duration,
}

#[async_trait]
impl DownloadPostProcessor for SlowIngest {
    async fn on_completed(&self, _download: &DownloadSnapshot) -> Result<Option<ModelRecord>> {
        tokio::time::sleep(self.delay).await;
        Ok(None)
    }
}

#[tokio::test]
async fn test_cancel_while_finishing_conflicts() {
    let temp = TempDir::new().unwrap();
    let downloads = DownloadCoordinator::builder(Arc::new(MemorySource::new(body())))
        .settings(DownloadSettings {
            concurrency: 1,
            progress_interval: Duration::ZERO,
            ..Default::default()
        })
        .post_processor(Arc::new(SlowIngest {
            delay: Duration::from_millis(300),
        }))
        .build();
    let destination = temp.path().join("model.safetensors");

    let id = downloads
        .start(mem("model.safetensors"), &destination, StartOptions::default())
        .await
        .unwrap();
    let landed = destination.as_path();
    eventually(move || async move { landed.exists() }).await;

    assert!(matches!(
        downloads.cancel(&id).await,
        Err(ShelfError::Conflict(_))
    ));
    assert!(matches!(
        downloads.pause(&id).await,
        Err(ShelfError::Conflict(_))
    ));

    let done = downloads.wait_settled(&id).await.unwrap();
    assert_eq!(done.state, DownloadState::Completed);
    assert_eq!(std::fs::read(&destination).unwrap(), body());
}
