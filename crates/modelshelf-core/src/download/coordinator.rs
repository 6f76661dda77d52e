//! Bounded-concurrency download queue.
//!
//! Every job runs on its own task and waits for one of `K` semaphore permits
//! before touching the network. Bytes stream into `<destination>.part`; the
//! partial file is renamed into place only after the transfer (and optional
//! checksum) succeeded. Pause keeps the partial file for a later ranged
//! resume, cancel deletes it.

use crate::cancel::CancellationToken;
use crate::config::DownloadSettings;
use crate::download::persistence::DownloadPersistence;
use crate::download::source::{TransferRequest, TransferResponse, TransferSource};
use crate::download::types::{
    DownloadJob, DownloadSnapshot, DownloadSource, DownloadState, RemoteIdentity, ResumeToken,
    StartOptions,
};
use crate::error::{Result, ShelfError};
use crate::hashing::verify_sha256;
use crate::progress::{OperationKind, ProgressBroadcaster, ProgressSnapshot, ProgressStatus};
use crate::types::ModelRecord;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Hook run after a transfer lands at its destination.
#[async_trait]
pub trait DownloadPostProcessor: Send + Sync {
    /// Catalogue the finished file. Returns the inserted record, if any.
    async fn on_completed(&self, download: &DownloadSnapshot) -> Result<Option<ModelRecord>>;
}

/// Pause and cancel signals of one job.
#[derive(Clone, Default)]
struct JobSignals {
    pause: CancellationToken,
    cancel: CancellationToken,
}

impl JobSignals {
    /// Resolves once either signal fires; cancel wins when both are set.
    async fn interrupted(&self) -> ShelfError {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ShelfError::Cancelled,
            _ = self.pause.cancelled() => ShelfError::DownloadPaused,
        }
    }
}

struct JobEntry {
    job: DownloadJob,
    signals: JobSignals,
    /// Set once the transfer is done and the file is being moved into place
    /// and post-processed. Pause and cancel are refused from then on.
    finalizing: bool,
    finished_at: Option<Instant>,
}

impl JobEntry {
    fn new(job: DownloadJob) -> Self {
        Self {
            job,
            signals: JobSignals::default(),
            finalizing: false,
            finished_at: None,
        }
    }
}

struct Inner {
    source: Arc<dyn TransferSource>,
    settings: DownloadSettings,
    jobs: RwLock<HashMap<String, JobEntry>>,
    permits: Arc<Semaphore>,
    broadcaster: Arc<ProgressBroadcaster>,
    post_processor: Option<Arc<dyn DownloadPostProcessor>>,
    persistence: Option<DownloadPersistence>,
}

pub struct DownloadCoordinatorBuilder {
    source: Arc<dyn TransferSource>,
    settings: DownloadSettings,
    broadcaster: Option<Arc<ProgressBroadcaster>>,
    post_processor: Option<Arc<dyn DownloadPostProcessor>>,
    persistence_path: Option<PathBuf>,
}

impl DownloadCoordinatorBuilder {
    pub fn settings(mut self, settings: DownloadSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<ProgressBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn post_processor(mut self, post_processor: Arc<dyn DownloadPostProcessor>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    /// Persist resumable jobs to `path` (usually `<data_dir>/downloads.json`).
    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence_path = Some(path.into());
        self
    }

    pub fn build(self) -> DownloadCoordinator {
        let permits = self.settings.concurrency.max(1);
        DownloadCoordinator {
            inner: Arc::new(Inner {
                source: self.source,
                settings: self.settings,
                jobs: RwLock::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(permits)),
                broadcaster: self.broadcaster.unwrap_or_default(),
                post_processor: self.post_processor,
                persistence: self.persistence_path.map(DownloadPersistence::new),
            }),
        }
    }
}

#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl DownloadCoordinator {
    pub fn builder(source: Arc<dyn TransferSource>) -> DownloadCoordinatorBuilder {
        DownloadCoordinatorBuilder {
            source,
            settings: DownloadSettings::default(),
            broadcaster: None,
            post_processor: None,
            persistence_path: None,
        }
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.inner.broadcaster
    }

    /// Queue a download. The returned id is also its progress operation id.
    pub async fn start(
        &self,
        source: DownloadSource,
        destination: impl Into<PathBuf>,
        options: StartOptions,
    ) -> Result<String> {
        let destination = destination.into();
        let url = source.request_url()?;
        if !self.inner.source.supports(&url) {
            return Err(ShelfError::UnsupportedSource(format!(
                "{} ({})",
                url.scheme(),
                source.url
            )));
        }
        if destination.file_name().is_none() {
            return Err(ShelfError::Validation {
                field: "destination".into(),
                message: format!("{} has no file name", destination.display()),
            });
        }
        if !options.overwrite && tokio::fs::try_exists(&destination).await.unwrap_or(false) {
            return Err(ShelfError::Conflict(format!(
                "{} already exists",
                destination.display()
            )));
        }

        self.inner.collect_garbage().await;

        let job = DownloadJob::new(source, destination, &options);
        let id = job.id.clone();
        {
            let mut jobs = self.inner.jobs.write().await;
            if let Some(other) = jobs
                .values()
                .find(|e| e.job.destination == job.destination && e.job.state.holds_destination())
            {
                return Err(ShelfError::Conflict(format!(
                    "Download {} already targets {}",
                    other.job.id,
                    job.destination.display()
                )));
            }
            let entry = JobEntry::new(job);
            self.inner.persist(&entry.job);
            self.inner.publish(&entry.job);
            info!("Queued download {} -> {}", id, entry.job.destination.display());
            jobs.insert(id.clone(), entry);
        }

        self.inner.spawn(id.clone());
        Ok(id)
    }

    /// Request a pause. Takes effect at the next chunk boundary.
    pub async fn pause(&self, id: &str) -> Result<DownloadSnapshot> {
        let mut jobs = self.inner.jobs.write().await;
        let entry = jobs.get_mut(id).ok_or_else(|| not_found(id))?;
        match entry.job.state {
            DownloadState::Downloading if entry.finalizing => {
                return Err(finishing(id));
            }
            DownloadState::Queued | DownloadState::Downloading => {
                entry.signals.pause.cancel();
                entry.job.pause_requested = true;
                entry.job.touch();
                debug!("Pause requested for {}", id);
            }
            DownloadState::Paused => {}
            state => {
                return Err(ShelfError::Conflict(format!(
                    "Cannot pause a {} download",
                    state
                )))
            }
        }
        Ok(entry.job.snapshot())
    }

    /// Requeue a paused or failed job; it resumes from its partial file.
    pub async fn resume(&self, id: &str) -> Result<DownloadSnapshot> {
        let snapshot = {
            let mut jobs = self.inner.jobs.write().await;
            let entry = jobs.get_mut(id).ok_or_else(|| not_found(id))?;
            match entry.job.state {
                DownloadState::Paused | DownloadState::Failed => {
                    entry.signals.pause.reset();
                    entry.job.state = DownloadState::Queued;
                    entry.job.error = None;
                    entry.job.error_kind = None;
                    entry.job.pause_requested = false;
                    entry.job.touch();
                    self.inner.persist(&entry.job);
                    self.inner.publish(&entry.job);
                    entry.job.snapshot()
                }
                DownloadState::Queued | DownloadState::Downloading
                    if !entry.job.pause_requested =>
                {
                    return Ok(entry.job.snapshot())
                }
                DownloadState::Queued | DownloadState::Downloading => {
                    return Err(ShelfError::Conflict(format!(
                        "Download {} is still pausing",
                        id
                    )))
                }
                state => {
                    return Err(ShelfError::Conflict(format!(
                        "Cannot resume a {} download",
                        state
                    )))
                }
            }
        };

        info!("Resuming download {}", id);
        self.inner.spawn(id.to_string());
        Ok(snapshot)
    }

    /// Cancel a job and delete its partial file.
    ///
    /// Running jobs are signalled and clean up on their own task; paused and
    /// failed jobs are finalized here.
    pub async fn cancel(&self, id: &str) -> Result<DownloadSnapshot> {
        let mut jobs = self.inner.jobs.write().await;
        let entry = jobs.get_mut(id).ok_or_else(|| not_found(id))?;
        match entry.job.state {
            DownloadState::Downloading if entry.finalizing => {
                return Err(finishing(id));
            }
            DownloadState::Queued | DownloadState::Downloading => {
                entry.signals.cancel.cancel();
                entry.job.touch();
            }
            DownloadState::Paused | DownloadState::Failed => {
                remove_partial(&entry.job.part_path()).await;
                mark_cancelled(entry);
                self.inner.persist(&entry.job);
                self.inner.publish(&entry.job);
                info!("Cancelled download {}", id);
            }
            DownloadState::Cancelled => {}
            DownloadState::Completed => {
                return Err(ShelfError::Conflict(format!(
                    "Download {} already completed",
                    id
                )))
            }
        }
        Ok(entry.job.snapshot())
    }

    /// Current snapshot; `None` once an unknown or collected id.
    pub async fn status(&self, id: &str) -> Option<DownloadSnapshot> {
        self.inner.collect_garbage().await;
        self.inner
            .jobs
            .read()
            .await
            .get(id)
            .map(|entry| entry.job.snapshot())
    }

    pub async fn list(&self) -> Vec<DownloadSnapshot> {
        self.inner.collect_garbage().await;
        let mut all: Vec<DownloadSnapshot> = self
            .inner
            .jobs
            .read()
            .await
            .values()
            .map(|entry| entry.job.snapshot())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Wait until a job is paused or terminal and return its snapshot.
    pub async fn wait_settled(&self, id: &str) -> Option<DownloadSnapshot> {
        let mut events = self.inner.broadcaster.subscribe();
        loop {
            let snapshot = self.status(id).await?;
            if snapshot.state.is_terminal() || snapshot.state == DownloadState::Paused {
                return Some(snapshot);
            }
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return self.status(id).await,
            }
        }
    }

    /// Pause every queued or running job. Returns how many were signalled.
    pub async fn pause_all(&self) -> usize {
        let ids: Vec<String> = self
            .inner
            .jobs
            .read()
            .await
            .values()
            .filter(|e| matches!(e.job.state, DownloadState::Queued | DownloadState::Downloading))
            .map(|e| e.job.id.clone())
            .collect();
        let mut paused = 0;
        for id in ids {
            if self.pause(&id).await.is_ok() {
                paused += 1;
            }
        }
        paused
    }

    /// Reload jobs persisted by a previous process.
    ///
    /// Jobs whose partial file survived come back as `Paused`; the rest are
    /// dropped from the persistence file.
    pub async fn restore_persisted(&self) -> usize {
        let Some(persistence) = &self.inner.persistence else {
            return 0;
        };

        let mut restored = 0;
        for mut job in persistence.load_all() {
            let on_disk = tokio::fs::metadata(job.part_path()).await.map(|m| m.len()).ok();
            let Some(len) = on_disk else {
                debug!("Dropping persisted download {}: no partial file", job.id);
                if let Err(e) = persistence.remove(&job.id) {
                    warn!("Failed to drop persisted download {}: {}", job.id, e);
                }
                continue;
            };

            job.state = DownloadState::Paused;
            job.pause_requested = false;
            job.received_bytes = if job.resume.is_some() { len } else { 0 };
            if let Some(resume) = job.resume.as_mut() {
                resume.offset = job.received_bytes;
            }
            job.touch();

            let mut jobs = self.inner.jobs.write().await;
            let occupied = jobs.contains_key(&job.id)
                || jobs
                    .values()
                    .any(|e| e.job.destination == job.destination && e.job.state.holds_destination());
            if occupied {
                continue;
            }
            let entry = JobEntry::new(job);
            self.inner.persist(&entry.job);
            self.inner.publish(&entry.job);
            info!(
                "Restored download {} at {} bytes",
                entry.job.id, entry.job.received_bytes
            );
            jobs.insert(entry.job.id.clone(), entry);
            restored += 1;
        }
        restored
    }
}

fn not_found(id: &str) -> ShelfError {
    ShelfError::NotFound(format!("download {}", id))
}

fn finishing(id: &str) -> ShelfError {
    ShelfError::Conflict(format!("Download {} is already finishing", id))
}

fn mark_cancelled(entry: &mut JobEntry) {
    entry.job.state = DownloadState::Cancelled;
    entry.job.received_bytes = 0;
    entry.job.resume = None;
    entry.job.pause_requested = false;
    entry.job.touch();
    entry.finished_at = Some(Instant::now());
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", path.display(), e),
    }
}

async fn run_job(inner: Arc<Inner>, id: String) {
    let Some(signals) = inner.signals(&id).await else {
        return;
    };

    let permit = tokio::select! {
        biased;
        err = signals.interrupted() => {
            inner.finish_interrupted(&id, err).await;
            return;
        }
        permit = inner.permits.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                inner.finish_failed(&id, ShelfError::Other("Download queue closed".into())).await;
                return;
            }
        },
    };

    inner
        .transition(&id, true, |entry| {
            entry.job.state = DownloadState::Downloading;
            entry.job.error = None;
            entry.job.error_kind = None;
        })
        .await;

    let outcome = match inner.transfer_with_retries(&id, &signals).await {
        Ok(()) => match inner.begin_finalizing(&id).await {
            Ok(()) => inner.finalize_file(&id).await,
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };
    drop(permit);

    match outcome {
        Ok(()) => inner.finish_completed(&id).await,
        Err(err @ (ShelfError::DownloadPaused | ShelfError::Cancelled)) => {
            inner.finish_interrupted(&id, err).await
        }
        Err(e) => inner.finish_failed(&id, e).await,
    }
}

impl Inner {
    fn spawn(self: &Arc<Self>, id: String) {
        tokio::spawn(run_job(self.clone(), id));
    }

    async fn signals(&self, id: &str) -> Option<JobSignals> {
        self.jobs.read().await.get(id).map(|e| e.signals.clone())
    }

    async fn job(&self, id: &str) -> Result<DownloadJob> {
        self.jobs
            .read()
            .await
            .get(id)
            .map(|e| e.job.clone())
            .ok_or_else(|| not_found(id))
    }

    /// Mutate a job under the table lock and publish it. Persisting happens
    /// under the same lock so file order matches state order.
    async fn transition<F>(&self, id: &str, persist: bool, edit: F) -> Option<DownloadJob>
    where
        F: FnOnce(&mut JobEntry),
    {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(id)?;
        edit(entry);
        entry.job.touch();
        if persist {
            self.persist(&entry.job);
        }
        self.publish(&entry.job);
        Some(entry.job.clone())
    }

    fn persist(&self, job: &DownloadJob) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let result = if job.state.holds_destination() {
            persistence.save(job)
        } else {
            persistence.remove(&job.id)
        };
        if let Err(e) = result {
            warn!("Failed to persist download {}: {}", job.id, e);
        }
    }

    fn publish(&self, job: &DownloadJob) {
        let status = match job.state {
            DownloadState::Queued => ProgressStatus::Queued,
            DownloadState::Downloading => ProgressStatus::Processing,
            DownloadState::Paused => ProgressStatus::Paused,
            DownloadState::Completed => ProgressStatus::Completed,
            DownloadState::Cancelled => ProgressStatus::Cancelled,
            DownloadState::Failed => ProgressStatus::Failed,
        };
        let mut snapshot = ProgressSnapshot::new(OperationKind::Download, status)
            .with_bytes(job.received_bytes, job.total_bytes);
        if let Some(message) = job.error.as_ref().or(job.post_process_error.as_ref()) {
            snapshot = snapshot.with_message(message.clone());
        }
        self.broadcaster.publish(job.id.clone(), snapshot);
    }

    /// Drop completed and cancelled jobs past their retention window.
    async fn collect_garbage(&self) {
        let retention = self.settings.terminal_retention;
        let expired = |entry: &JobEntry| {
            matches!(
                entry.job.state,
                DownloadState::Completed | DownloadState::Cancelled
            ) && entry
                .finished_at
                .is_some_and(|at| at.elapsed() >= retention)
        };
        if !self.jobs.read().await.values().any(expired) {
            return;
        }
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| !expired(entry));
        debug!("Collected {} finished downloads", before - jobs.len());
    }

    async fn transfer_with_retries(&self, id: &str, signals: &JobSignals) -> Result<()> {
        let job = self.job(id).await?;
        if let Some(parent) = job.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ShelfError::io_with_path(e, parent))?;
        }

        let retry = &self.settings.retry;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.transition(id, false, |entry| entry.job.attempts = attempt).await;

            match self.transfer_once(id, signals).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && retry.allows_retry_after(attempt) => {
                    let delay = retry.calculate_delay(attempt - 1);
                    warn!(
                        "Download {} attempt {}/{} failed: {}. Retrying in {:?}",
                        id, attempt, retry.max_attempts, e, delay
                    );
                    self.transition(id, false, |entry| {
                        entry.job.error = Some(e.to_string());
                        entry.job.error_kind = Some(e.kind().to_string());
                    })
                    .await;
                    tokio::select! {
                        biased;
                        err = signals.interrupted() => return Err(err),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One connection: pick a resume offset, open, validate, stream.
    async fn transfer_once(&self, id: &str, signals: &JobSignals) -> Result<()> {
        let job = self.job(id).await?;
        let url = job.source.request_url()?;
        let part = job.part_path();
        let on_disk = tokio::fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);
        let validator = job.resume.as_ref().map(|r| r.identity.clone());
        let mut offset = if validator.is_some() {
            job.received_bytes.min(on_disk)
        } else {
            0
        };

        for _ in 0..2 {
            let request = TransferRequest {
                url: url.clone(),
                auth: job.source.auth.clone(),
                offset,
                validator: if offset > 0 { validator.clone() } else { None },
            };
            let opened = tokio::select! {
                biased;
                err = signals.interrupted() => return Err(err),
                opened = tokio::time::timeout(self.settings.read_timeout, self.source.open(&request)) => opened,
            };
            let response = match opened {
                Err(_) => return Err(ShelfError::Timeout(self.settings.read_timeout)),
                Ok(Err(ShelfError::HttpStatus { status: 416, .. })) if offset > 0 => {
                    warn!("Download {}: range not satisfiable, restarting from zero", id);
                    offset = 0;
                    continue;
                }
                Ok(result) => result?,
            };

            if offset > 0 {
                let same_content = validator
                    .as_ref()
                    .map_or(true, |v| v.matches(&response.identity));
                if response.partial && response.start == offset && same_content {
                    return self.stream_body(id, response, offset, &part, signals).await;
                }
                if response.partial {
                    warn!("Download {}: remote content changed, restarting from zero", id);
                    offset = 0;
                    continue;
                }
                warn!("Server does not support Range requests, restarting from zero");
            }

            if response.partial && response.start != 0 {
                return Err(ShelfError::DownloadFailed {
                    url: job.source.url.clone(),
                    message: format!("Unexpected range start {}", response.start),
                });
            }
            return self.stream_body(id, response, 0, &part, signals).await;
        }

        Err(ShelfError::DownloadFailed {
            url: job.source.url,
            message: "Could not establish a consistent byte range".into(),
        })
    }

    async fn stream_body(
        &self,
        id: &str,
        response: TransferResponse,
        offset: u64,
        part: &Path,
        signals: &JobSignals,
    ) -> Result<()> {
        let TransferResponse {
            total,
            identity,
            mut body,
            ..
        } = response;
        let io_err = |e: std::io::Error| ShelfError::io_with_path(e, part);

        let mut file = if offset > 0 {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(part)
                .await
                .map_err(io_err)?;
            file.set_len(offset).await.map_err(io_err)?;
            file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
            file
        } else {
            tokio::fs::File::create(part).await.map_err(io_err)?
        };

        let identity = RemoteIdentity {
            length: total,
            ..identity
        };
        self.transition(id, true, |entry| {
            entry.job.received_bytes = offset;
            entry.job.total_bytes = total;
            entry.job.resume = Some(ResumeToken { offset, identity });
        })
        .await;
        if offset > 0 {
            info!("Resuming download {} from byte {}", id, offset);
        }

        let pumped = self.pump(id, &mut file, &mut body, offset, total, signals).await;
        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        let received = pumped?;
        synced.map_err(io_err)?;

        match total {
            Some(total) if received != total => Err(ShelfError::Network {
                message: format!("Incomplete download: received {} of {} bytes", received, total),
                cause: None,
            }),
            _ => Ok(()),
        }
    }

    /// Copy body chunks into `file`, returning the final byte count.
    async fn pump(
        &self,
        id: &str,
        file: &mut tokio::fs::File,
        body: &mut BoxStream<'static, Result<Bytes>>,
        offset: u64,
        total: Option<u64>,
        signals: &JobSignals,
    ) -> Result<u64> {
        let mut received = offset;
        let mut last_publish = Instant::now();
        loop {
            let next = tokio::select! {
                biased;
                err = signals.interrupted() => return Err(err),
                next = tokio::time::timeout(self.settings.read_timeout, body.next()) => next,
            };
            let chunk = match next {
                Err(_) => return Err(ShelfError::Timeout(self.settings.read_timeout)),
                Ok(None) => return Ok(received),
                Ok(Some(chunk)) => chunk?,
            };

            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if total.is_some_and(|total| received > total) {
                return Err(ShelfError::Network {
                    message: format!("Received more than the advertised {:?} bytes", total),
                    cause: None,
                });
            }

            let publish_now = last_publish.elapsed() >= self.settings.progress_interval;
            let mut jobs = self.jobs.write().await;
            if let Some(entry) = jobs.get_mut(id) {
                entry.job.received_bytes = received;
                if let Some(resume) = entry.job.resume.as_mut() {
                    resume.offset = received;
                }
                if publish_now {
                    entry.job.touch();
                    self.publish(&entry.job);
                    last_publish = Instant::now();
                }
            }
        }
    }

    /// Claim a fully transferred job. A cancel that arrived after the last
    /// chunk still wins; a pending pause is dropped.
    async fn begin_finalizing(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(id).ok_or_else(|| not_found(id))?;
        if entry.signals.cancel.is_cancelled() {
            return Err(ShelfError::Cancelled);
        }
        entry.finalizing = true;
        entry.job.pause_requested = false;
        Ok(())
    }

    /// Verify the checksum if one was given, then move the file into place.
    async fn finalize_file(&self, id: &str) -> Result<()> {
        let job = self.job(id).await?;
        let part = job.part_path();
        if let Some(expected) = &job.expected_sha256 {
            if !verify_sha256(&part, expected).await? {
                remove_partial(&part).await;
                return Err(ShelfError::DownloadFailed {
                    url: job.source.url.clone(),
                    message: "SHA-256 mismatch".into(),
                });
            }
        }
        tokio::fs::rename(&part, &job.destination)
            .await
            .map_err(|e| ShelfError::io_with_path(e, &job.destination))?;
        Ok(())
    }

    async fn finish_completed(&self, id: &str) {
        let Ok(job) = self.job(id).await else {
            return;
        };
        info!("Download complete: {}", job.destination.display());

        let mut record_hash = None;
        let mut post_error = None;
        if let Some(post) = &self.post_processor {
            let mut snapshot = job.snapshot();
            snapshot.state = DownloadState::Completed;
            match post.on_completed(&snapshot).await {
                Ok(record) => record_hash = record.map(|r| r.hash),
                Err(e) => {
                    warn!("Post-processing {} failed: {}", job.destination.display(), e);
                    post_error = Some(e.to_string());
                }
            }
        }

        self.transition(id, true, |entry| {
            entry.job.state = DownloadState::Completed;
            entry.job.pause_requested = false;
            entry.job.error = None;
            entry.job.error_kind = None;
            if let Some(total) = entry.job.total_bytes {
                entry.job.received_bytes = total;
            }
            entry.job.record_hash = record_hash;
            entry.job.post_process_error = post_error;
            entry.finalizing = false;
            entry.finished_at = Some(Instant::now());
        })
        .await;
    }

    /// Settle a job interrupted by its pause or cancel signal.
    async fn finish_interrupted(&self, id: &str, reason: ShelfError) {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(id) else {
            return;
        };
        if matches!(reason, ShelfError::Cancelled) || entry.signals.cancel.is_cancelled() {
            remove_partial(&entry.job.part_path()).await;
            mark_cancelled(entry);
            info!("Cancelled download {}", id);
        } else {
            entry.job.state = DownloadState::Paused;
            entry.job.pause_requested = false;
            entry.job.touch();
            info!(
                "Paused download {} at {} bytes",
                id, entry.job.received_bytes
            );
        }
        self.persist(&entry.job);
        self.publish(&entry.job);
    }

    async fn finish_failed(&self, id: &str, err: ShelfError) {
        error!("Download {} failed: {}", id, err);
        self.transition(id, true, |entry| {
            entry.job.state = DownloadState::Failed;
            entry.job.pause_requested = false;
            entry.finalizing = false;
            entry.job.error = Some(err.to_string());
            entry.job.error_kind = Some(err.kind().to_string());
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::source::TransferResponse;
    use futures::stream;
    use tempfile::TempDir;
    use url::Url;

    /// Serves a fixed body, honouring ranges.
    struct StaticSource {
        body: Vec<u8>,
        ranges: bool,
    }

    #[async_trait]
    impl TransferSource for StaticSource {
        fn supports(&self, url: &Url) -> bool {
            url.scheme() == "mem"
        }

        async fn open(&self, request: &TransferRequest) -> Result<TransferResponse> {
            let start = if self.ranges { request.offset as usize } else { 0 };
            let chunks: Vec<Result<Bytes>> = self.body[start..]
                .chunks(4)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(TransferResponse {
                partial: self.ranges && start > 0,
                start: start as u64,
                total: Some(self.body.len() as u64),
                identity: RemoteIdentity::default(),
                body: stream::iter(chunks).boxed(),
            })
        }
    }

    fn coordinator(body: &[u8]) -> DownloadCoordinator {
        DownloadCoordinator::builder(Arc::new(StaticSource {
            body: body.to_vec(),
            ranges: true,
        }))
        .build()
    }

    #[tokio::test]
    async fn test_download_completes() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sub/model.safetensors");
        let coordinator = coordinator(b"hello download world");

        let id = coordinator
            .start(DownloadSource::new("mem://model"), &dest, StartOptions::default())
            .await
            .unwrap();
        let done = coordinator.wait_settled(&id).await.unwrap();

        assert_eq!(done.state, DownloadState::Completed);
        assert_eq!(done.received_bytes, 20);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello download world");
        assert!(!dir.path().join("sub/model.safetensors.part").exists());
    }

    #[tokio::test]
    async fn test_unsupported_scheme_rejected() {
        let dir = TempDir::new().unwrap();
        let result = coordinator(b"x")
            .start(
                DownloadSource::new("ftp://host/file"),
                dir.path().join("f.bin"),
                StartOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(ShelfError::UnsupportedSource(_))));
    }

    #[tokio::test]
    async fn test_existing_destination_conflicts() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("model.safetensors");
        std::fs::write(&dest, b"old").unwrap();

        let coordinator = coordinator(b"new bytes");
        let result = coordinator
            .start(DownloadSource::new("mem://m"), &dest, StartOptions::default())
            .await;
        assert!(matches!(result, Err(ShelfError::Conflict(_))));

        let id = coordinator
            .start(
                DownloadSource::new("mem://m"),
                &dest,
                StartOptions {
                    overwrite: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        coordinator.wait_settled(&id).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new bytes");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("model.safetensors");
        let coordinator = coordinator(b"payload");

        let id = coordinator
            .start(
                DownloadSource::new("mem://m"),
                &dest,
                StartOptions {
                    expected_sha256: Some("00".repeat(32)),
                    overwrite: false,
                },
            )
            .await
            .unwrap();
        let done = coordinator.wait_settled(&id).await.unwrap();

        assert_eq!(done.state, DownloadState::Failed);
        assert_eq!(done.error_kind.as_deref(), Some("download"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let coordinator = coordinator(b"x");
        assert!(coordinator.status("nope").await.is_none());
        assert!(matches!(
            coordinator.pause("nope").await,
            Err(ShelfError::NotFound(_))
        ));
    }
}
