//! One library: its roots, cache snapshot, durable store and writer.
//!
//! Readers clone the current [`LibraryCache`] snapshot and never wait.
//! Mutations serialize through the writer mutex, build the next snapshot on a
//! copy, verify the touched paths, resort if needed, mirror the change to the
//! [`PersistentStore`] in one transaction, and only then swap the snapshot in.
//! A failure at any step leaves the previous snapshot untouched.

mod organize;
mod reports;

pub use organize::{folder_name, target_path};
pub use reports::{
    Drift, ItemError, MutationOutcome, OrganizeMove, OrganizeReport, ReconcileReport,
    RefreshReport,
};

use crate::cache::{LibraryCache, TagCount};
use crate::cancel::CancellationToken;
use crate::config::{LibraryConfig, ShelfConfig, StoreConfig};
use crate::error::{Result, ShelfError};
use crate::metadata::{MetadataResolver, Resolution};
use crate::progress::{OperationKind, ProgressBroadcaster, ProgressSnapshot, ProgressStatus};
use crate::scanner::{FileScanner, ScanMode, ScanProgressFn, ScanReport};
use crate::store::{read_json, write_json, PersistentStore, StoreBatch};
use crate::types::{ModelMetadata, ModelRecord, Page, RecordFilter, SortOrder};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Held while a bulk refresh or organize runs.
struct BulkGuard<'a>(&'a AtomicBool);

impl<'a> BulkGuard<'a> {
    fn acquire(flag: &'a AtomicBool, library: &str) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| {
                ShelfError::Conflict(format!(
                    "A bulk operation is already running on library {}",
                    library
                ))
            })?;
        Ok(Self(flag))
    }
}

impl Drop for BulkGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ModelLibrary {
    config: LibraryConfig,
    scanner: FileScanner,
    /// `None` once closed; dropping the store releases the library lock.
    store: Mutex<Option<PersistentStore>>,
    snapshot: RwLock<Arc<LibraryCache>>,
    /// Single writer for cache + store mutations.
    writer: tokio::sync::Mutex<()>,
    bulk_busy: AtomicBool,
    broadcaster: Arc<ProgressBroadcaster>,
}

impl ModelLibrary {
    /// Open the library's store (taking its lock) and load the snapshot.
    ///
    /// Without roots the saved root set is used.
    pub fn open(
        config: LibraryConfig,
        shelf: &ShelfConfig,
        broadcaster: Arc<ProgressBroadcaster>,
    ) -> Result<Self> {
        config.validate_name()?;
        let dir = shelf.library_dir(&config.name);
        let store = PersistentStore::open(&dir)?;
        let config = settle_roots(config, &dir)?;
        config.validate()?;
        let records = store.load_all()?;
        let cache = LibraryCache::from_records(records, config.sort)?;
        info!(
            "Opened library {} with {} records across {} roots",
            config.name,
            cache.len(),
            config.roots.len()
        );

        Ok(Self {
            scanner: FileScanner::new(config.roots.clone()),
            config,
            store: Mutex::new(Some(store)),
            snapshot: RwLock::new(Arc::new(cache)),
            writer: tokio::sync::Mutex::new(()),
            bulk_busy: AtomicBool::new(false),
            broadcaster,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    /// Progress operation id for `kind` on this library, e.g. `scan:main`.
    pub fn operation_id(&self, kind: OperationKind) -> String {
        let prefix = match kind {
            OperationKind::Scan => "scan",
            OperationKind::Reconcile => "reconcile",
            OperationKind::Refresh => "refresh",
            OperationKind::Organize => "organize",
            OperationKind::Download => "download",
        };
        format!("{}:{}", prefix, self.config.name)
    }

    pub fn is_closed(&self) -> bool {
        self.store.lock().unwrap_or_else(|p| p.into_inner()).is_none()
    }

    // ========================================
    // Reads
    // ========================================

    /// The last committed snapshot.
    pub fn snapshot(&self) -> Arc<LibraryCache> {
        self.snapshot
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn page(&self, offset: usize, limit: usize, filter: &RecordFilter) -> Page {
        self.snapshot().page(offset, limit, filter)
    }

    pub fn top_tags(&self, limit: usize) -> Result<Vec<TagCount>> {
        self.snapshot().top_tags(limit)
    }

    pub fn base_models(&self) -> Vec<String> {
        self.snapshot().base_models()
    }

    pub fn duplicate_groups(&self) -> BTreeMap<String, BTreeSet<PathBuf>> {
        self.snapshot().duplicate_groups()
    }

    pub fn filename_conflicts(&self) -> BTreeMap<String, BTreeSet<PathBuf>> {
        self.snapshot().filename_conflicts()
    }

    pub fn by_hash(&self, hash: &str) -> Vec<ModelRecord> {
        self.snapshot()
            .by_hash(&hash.to_lowercase())
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn by_path(&self, path: &Path) -> Option<ModelRecord> {
        self.snapshot().by_path(path).cloned()
    }

    // ========================================
    // Commit
    // ========================================

    fn with_store<R>(&self, f: impl FnOnce(&PersistentStore) -> Result<R>) -> Result<R> {
        let guard = self.store.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(store) => f(store),
            None => Err(ShelfError::Conflict(format!(
                "Library {} is closed",
                self.config.name
            ))),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        self.with_store(|_| Ok(()))
    }

    /// Apply `edit` to a copy of the snapshot and publish it.
    ///
    /// Callers must hold the writer lock. `edit` records every change it
    /// makes to the cache in the batch.
    fn commit<F>(&self, _writer: &tokio::sync::MutexGuard<'_, ()>, edit: F) -> Result<MutationOutcome>
    where
        F: FnOnce(&mut LibraryCache, &mut StoreBatch) -> Result<()>,
    {
        let current = self.snapshot();
        let mut next = LibraryCache::clone(&current);
        let mut batch = StoreBatch::default();
        edit(&mut next, &mut batch)?;
        if batch.is_empty() {
            return Ok(MutationOutcome::default());
        }

        next.verify_paths(&batch.touched_paths())?;
        let resorted = next.needs_resort();
        if resorted {
            next.resort(None);
        }
        self.with_store(|store| store.apply(&batch))?;

        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(next);
        debug!(
            "Committed {} upserts and {} removals to {}",
            batch.upserts.len(),
            batch.removals.len(),
            self.config.name
        );
        Ok(MutationOutcome {
            updated: batch.upserts,
            removed: batch.removals,
            resorted,
            errors: Vec::new(),
        })
    }

    /// Edit one record under the writer.
    async fn edit_record<F>(&self, path: &Path, edit: F) -> Result<MutationOutcome>
    where
        F: FnOnce(&mut ModelRecord),
    {
        let writer = self.writer.lock().await;
        self.commit(&writer, |cache, batch| {
            let record = cache.update(path, edit)?;
            batch.upsert(record);
            Ok(())
        })
    }

    // ========================================
    // Scanning
    // ========================================

    /// Scan every root and commit the result as one batch.
    pub async fn scan(&self, mode: ScanMode, cancel: &CancellationToken) -> Result<ScanReport> {
        let writer = self.writer.lock().await;
        self.ensure_open()?;

        let op_id = self.operation_id(OperationKind::Scan);
        self.broadcaster.publish(
            &op_id,
            ProgressSnapshot::new(OperationKind::Scan, ProgressStatus::Started),
        );

        let broadcaster = self.broadcaster.clone();
        let progress_id = op_id.clone();
        let on_progress: ScanProgressFn = Arc::new(move |processed: usize, total: usize| {
            broadcaster.publish(
                progress_id.clone(),
                ProgressSnapshot::new(OperationKind::Scan, ProgressStatus::Processing)
                    .with_counts(processed as u64, total as u64),
            );
        });

        let existing = self.snapshot();
        let result = match self.scanner.scan(&existing, mode, cancel, Some(on_progress)).await {
            Ok(outcome) => {
                let scan_batch = outcome.batch;
                self.commit(&writer, |cache, batch| {
                    for path in &scan_batch.removals {
                        cache.remove(path);
                    }
                    for record in &scan_batch.upserts {
                        cache.upsert(record.clone());
                    }
                    *batch = scan_batch;
                    Ok(())
                })
                .map(|_| outcome.report)
            }
            Err(e) => Err(e),
        };

        let status = match &result {
            Ok(_) => ProgressStatus::Completed,
            Err(ShelfError::Cancelled) => ProgressStatus::Cancelled,
            Err(_) => ProgressStatus::Failed,
        };
        let mut snapshot = ProgressSnapshot::new(OperationKind::Scan, status);
        match &result {
            Ok(report) => {
                snapshot = snapshot
                    .with_counts(report.files_seen as u64, report.files_seen as u64)
                    .with_message(format!(
                        "{} added, {} changed, {} removed, {} errors",
                        report.added,
                        report.changed,
                        report.removed,
                        report.errors.len()
                    ));
            }
            Err(e) => snapshot = snapshot.with_message(e.to_string()),
        }
        self.broadcaster.publish(op_id, snapshot);
        result
    }

    /// Compare a stat-only pass against the store; scan only on drift.
    ///
    /// Drift triggers a Quick scan, `force` a Full one.
    pub async fn reconcile(&self, force: bool, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let op_id = self.operation_id(OperationKind::Reconcile);
        self.broadcaster.publish(
            &op_id,
            ProgressSnapshot::new(OperationKind::Reconcile, ProgressStatus::Started),
        );

        let result = self.reconcile_inner(force, cancel).await;
        let snapshot = match &result {
            Ok(report) => ProgressSnapshot::new(OperationKind::Reconcile, ProgressStatus::Completed)
                .with_message(match &report.scan {
                    Some(_) => "scanned",
                    None => "no drift",
                }),
            Err(ShelfError::Cancelled) => {
                ProgressSnapshot::new(OperationKind::Reconcile, ProgressStatus::Cancelled)
            }
            Err(e) => ProgressSnapshot::new(OperationKind::Reconcile, ProgressStatus::Failed)
                .with_message(e.to_string()),
        };
        self.broadcaster.publish(op_id, snapshot);
        result
    }

    async fn reconcile_inner(&self, force: bool, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let stored = self.with_store(|store| store.stats())?;
        let scanner = self.scanner.clone();
        let pass = tokio::task::spawn_blocking(move || scanner.stat_pass())
            .await
            .map_err(|e| ShelfError::Other(format!("Stat pass task failed: {}", e)))?;
        cancel.check()?;

        let mut drift = Drift::default();
        let mut seen = HashSet::new();
        for file in &pass.files {
            seen.insert(file.path.as_path());
            match stored.get(&file.path) {
                None => drift.added.push(file.path.clone()),
                Some(stat) if stat.size != file.size || stat.modified != file.modified => {
                    drift.changed.push(file.path.clone())
                }
                Some(_) => {}
            }
        }
        for path in stored.keys() {
            if !seen.contains(path.as_path()) && !pass.covers_unreadable(path) {
                drift.missing.push(path.clone());
            }
        }
        drift.missing.sort();

        let mode = if force {
            Some(ScanMode::Full)
        } else if !drift.is_empty() {
            Some(ScanMode::Quick)
        } else {
            None
        };
        info!(
            "Reconcile {}: {} added, {} missing, {} changed",
            self.config.name,
            drift.added.len(),
            drift.missing.len(),
            drift.changed.len()
        );

        let scan = match mode {
            Some(mode) => Some(self.scan(mode, cancel).await?),
            None => None,
        };
        Ok(ReconcileReport { drift, scan })
    }

    /// Hash one file and upsert its record.
    pub async fn insert_from_scan(&self, path: &Path) -> Result<MutationOutcome> {
        let record = self.scan_one(path, None).await?;
        let writer = self.writer.lock().await;
        self.commit(&writer, |cache, batch| {
            cache.upsert(record.clone());
            batch.upsert(record);
            Ok(())
        })
    }

    /// Catalogue a finished download: scan, resolve metadata, insert.
    pub async fn ingest_download(
        &self,
        path: &Path,
        resolver: Option<&MetadataResolver>,
    ) -> Result<ModelRecord> {
        let record = self.scan_one(path, resolver).await?;
        let writer = self.writer.lock().await;
        let committed = record.clone();
        self.commit(&writer, |cache, batch| {
            cache.upsert(committed.clone());
            batch.upsert(committed);
            Ok(())
        })?;
        info!("Catalogued {} as {}", path.display(), record.display_name);
        Ok(record)
    }

    async fn scan_one(&self, path: &Path, resolver: Option<&MetadataResolver>) -> Result<ModelRecord> {
        self.ensure_open()?;
        let existing = self.by_path(path);
        let mut record = self.scanner.scan_file(path, existing.as_ref()).await?;
        if let (None, Some(resolver)) = (&record.metadata, resolver) {
            if let Resolution::Resolved { metadata, provider } = resolver.resolve(&record.hash).await {
                debug!("Metadata for {} from {}", path.display(), provider);
                record.set_metadata(metadata);
            }
        }
        Ok(record)
    }

    // ========================================
    // Single-record mutations
    // ========================================

    /// Remove a record and delete its file.
    pub async fn delete(&self, path: &Path) -> Result<MutationOutcome> {
        let writer = self.writer.lock().await;
        self.ensure_open()?;
        if self.snapshot().by_path(path).is_none() {
            return Err(ShelfError::NotFound(path.display().to_string()));
        }
        let staged = stage_removal(path).await?;
        let committed = self.commit(&writer, |cache, batch| {
            cache.remove(path);
            batch.remove(path.to_path_buf());
            Ok(())
        });
        match committed {
            Ok(outcome) => {
                finish_removal(staged).await;
                info!("Deleted {}", path.display());
                Ok(outcome)
            }
            Err(e) => {
                warn!("Restoring {} after failed delete: {}", path.display(), e);
                restore_removal(path, staged).await;
                Err(e)
            }
        }
    }

    /// Move a model file on disk and follow it in the catalogue.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<MutationOutcome> {
        let writer = self.writer.lock().await;
        self.ensure_open()?;
        let record = self
            .snapshot()
            .by_path(from)
            .cloned()
            .ok_or_else(|| ShelfError::NotFound(from.display().to_string()))?;
        if self.scanner.eligible_kind(to) != Some(record.kind) {
            return Err(ShelfError::Validation {
                field: "to".into(),
                message: format!(
                    "{} is not a {} location of this library",
                    to.display(),
                    record.kind
                ),
            });
        }
        if tokio::fs::try_exists(to).await.unwrap_or(false) {
            return Err(ShelfError::Conflict(format!("{} already exists", to.display())));
        }

        move_file(from, to).await?;
        let committed = self.commit(&writer, |cache, batch| {
            let moved = cache.relocate(from, to.to_path_buf())?;
            batch.remove(from.to_path_buf());
            batch.upsert(moved);
            Ok(())
        });
        match committed {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("Rolling back rename of {}: {}", from.display(), e);
                if let Err(undo) = tokio::fs::rename(to, from).await {
                    warn!("Rollback of {} failed: {}", to.display(), undo);
                }
                Err(e)
            }
        }
    }

    pub async fn exclude(&self, path: &Path, excluded: bool) -> Result<MutationOutcome> {
        self.edit_record(path, |record| record.excluded = excluded).await
    }

    pub async fn set_favorite(&self, path: &Path, favorite: bool) -> Result<MutationOutcome> {
        self.edit_record(path, |record| record.favorite = favorite).await
    }

    /// Add tags (lowercased, trimmed; blanks ignored).
    pub async fn add_tags(&self, path: &Path, tags: &[String]) -> Result<MutationOutcome> {
        let tags = normalize_tags(tags);
        self.edit_record(path, |record| record.tags.extend(tags)).await
    }

    pub async fn remove_tags(&self, path: &Path, tags: &[String]) -> Result<MutationOutcome> {
        let tags = normalize_tags(tags);
        self.edit_record(path, |record| record.tags.retain(|t| !tags.contains(t)))
            .await
    }

    pub async fn apply_metadata(&self, path: &Path, metadata: ModelMetadata) -> Result<MutationOutcome> {
        self.edit_record(path, |record| {
            record.set_metadata(metadata);
        })
        .await
    }

    /// Switch the snapshot order.
    pub async fn set_sort(&self, order: SortOrder) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.ensure_open()?;
        let mut next = LibraryCache::clone(&self.snapshot());
        next.resort(Some(order));
        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(next);
        Ok(())
    }

    // ========================================
    // Bulk operations
    // ========================================

    /// Delete many records in one commit with a single resort.
    ///
    /// Unknown paths and files that cannot be removed are reported and
    /// skipped; the rest are committed together.
    pub async fn bulk_delete(&self, paths: &[PathBuf]) -> Result<MutationOutcome> {
        let writer = self.writer.lock().await;
        self.ensure_open()?;
        let snapshot = self.snapshot();

        let mut errors = Vec::new();
        let mut staged = Vec::new();
        for path in paths {
            if snapshot.by_path(path).is_none() {
                errors.push(ItemError::new(path, "not catalogued"));
                continue;
            }
            match stage_removal(path).await {
                Ok(aside) => staged.push((path.clone(), aside)),
                Err(e) => {
                    warn!("Could not delete {}: {}", path.display(), e);
                    errors.push(ItemError::new(path, e));
                }
            }
        }

        let committed = self.commit(&writer, |cache, batch| {
            for (path, _) in &staged {
                cache.remove(path);
                batch.remove(path.clone());
            }
            Ok(())
        });
        let mut outcome = match committed {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Restoring {} files after failed bulk delete: {}", staged.len(), e);
                for (path, aside) in staged {
                    restore_removal(&path, aside).await;
                }
                return Err(e);
            }
        };
        for (_, aside) in staged {
            finish_removal(aside).await;
        }
        info!(
            "Bulk delete on {}: {} removed, {} failed",
            self.config.name,
            outcome.removed.len(),
            errors.len()
        );
        outcome.errors = errors;
        Ok(outcome)
    }

    /// Resolve metadata for every record that has none.
    ///
    /// Providers are queried without holding the writer; results are
    /// committed in one batch. Records that changed meanwhile are skipped.
    pub async fn bulk_refresh(
        &self,
        resolver: &MetadataResolver,
        cancel: &CancellationToken,
    ) -> Result<RefreshReport> {
        let _bulk = BulkGuard::acquire(&self.bulk_busy, &self.config.name)?;
        self.ensure_open()?;
        let started = Instant::now();
        let op_id = self.operation_id(OperationKind::Refresh);

        let snapshot = self.snapshot();
        let targets: Vec<(PathBuf, String)> = snapshot
            .iter()
            .filter(|r| r.metadata.is_none())
            .map(|r| (r.path.clone(), r.hash.clone()))
            .collect();
        let total = targets.len() as u64;
        let mut report = RefreshReport {
            candidates: targets.len(),
            ..Default::default()
        };
        self.broadcaster.publish(
            &op_id,
            ProgressSnapshot::new(OperationKind::Refresh, ProgressStatus::Started).with_counts(0, total),
        );

        let mut answers: HashMap<String, Option<ModelMetadata>> = HashMap::new();
        let mut found = Vec::new();
        for (i, (path, hash)) in targets.into_iter().enumerate() {
            if cancel.is_cancelled() {
                self.broadcaster.publish(
                    &op_id,
                    ProgressSnapshot::new(OperationKind::Refresh, ProgressStatus::Cancelled)
                        .with_counts(i as u64, total),
                );
                return Err(ShelfError::Cancelled);
            }
            if !answers.contains_key(&hash) {
                let answer = match resolver.resolve(&hash).await {
                    Resolution::Resolved { metadata, .. } => Some(metadata),
                    Resolution::Unavailable => {
                        report.unavailable.push(hash.clone());
                        None
                    }
                };
                answers.insert(hash.clone(), answer);
            }
            if let Some(Some(metadata)) = answers.get(&hash) {
                found.push((path, hash, metadata.clone()));
            }
            self.broadcaster.publish(
                &op_id,
                ProgressSnapshot::new(OperationKind::Refresh, ProgressStatus::Processing)
                    .with_counts(i as u64 + 1, total),
            );
        }

        let writer = self.writer.lock().await;
        let mut resolved = 0;
        let mut stale = 0;
        let mut renamed = 0;
        let committed = self.commit(&writer, |cache, batch| {
            for (path, hash, metadata) in found {
                let current = cache.by_path(&path);
                if !current.is_some_and(|r| r.hash == hash && r.metadata.is_none()) {
                    stale += 1;
                    continue;
                }
                let mut name_changed = false;
                let record = cache.update(&path, |record| {
                    name_changed = record.set_metadata(metadata);
                })?;
                if name_changed {
                    renamed += 1;
                }
                resolved += 1;
                batch.upsert(record);
            }
            if renamed > 0 {
                cache.invalidate_order();
            }
            Ok(())
        });
        drop(writer);

        let outcome = match committed {
            Ok(outcome) => outcome,
            Err(e) => {
                self.broadcaster.publish(
                    &op_id,
                    ProgressSnapshot::new(OperationKind::Refresh, ProgressStatus::Failed)
                        .with_counts(total, total)
                        .with_message(e.to_string()),
                );
                return Err(e);
            }
        };

        report.resolved = resolved;
        report.stale = stale;
        report.renamed = renamed;
        report.resorted = outcome.resorted;
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Refresh on {}: {}/{} resolved, {} unavailable",
            self.config.name,
            report.resolved,
            report.candidates,
            report.unavailable.len()
        );
        self.broadcaster.publish(
            &op_id,
            ProgressSnapshot::new(OperationKind::Refresh, ProgressStatus::Completed)
                .with_counts(total, total)
                .with_message(format!("{} resolved", report.resolved)),
        );
        Ok(report)
    }

    /// Move every record into `<root>/<base model>/`.
    ///
    /// Files move first; the catalogue follows in one commit. If that commit
    /// fails every move is undone.
    pub async fn auto_organize(&self, cancel: &CancellationToken) -> Result<OrganizeReport> {
        let _bulk = BulkGuard::acquire(&self.bulk_busy, &self.config.name)?;
        let writer = self.writer.lock().await;
        self.ensure_open()?;
        let op_id = self.operation_id(OperationKind::Organize);

        let snapshot = self.snapshot();
        let total = snapshot.len() as u64;
        self.broadcaster.publish(
            &op_id,
            ProgressSnapshot::new(OperationKind::Organize, ProgressStatus::Started).with_counts(0, total),
        );

        let mut report = OrganizeReport::default();
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        for (i, record) in snapshot.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let Some(target) = target_path(&self.config, record) else {
                report.unsorted += 1;
                continue;
            };
            if target == record.path {
                report.in_place += 1;
                continue;
            }
            if snapshot.by_path(&target).is_some()
                || claimed.contains(&target)
                || tokio::fs::try_exists(&target).await.unwrap_or(false)
            {
                report
                    .errors
                    .push(ItemError::new(&record.path, format!("{} already exists", target.display())));
                continue;
            }
            match move_file(&record.path, &target).await {
                Ok(()) => {
                    claimed.insert(target.clone());
                    report.moved.push(OrganizeMove {
                        from: record.path.clone(),
                        to: target,
                    });
                }
                Err(e) => report.errors.push(ItemError::new(&record.path, e)),
            }
            if (i + 1) % 50 == 0 {
                self.broadcaster.publish(
                    &op_id,
                    ProgressSnapshot::new(OperationKind::Organize, ProgressStatus::Processing)
                        .with_counts(i as u64 + 1, total),
                );
            }
        }

        let moves = report.moved.clone();
        let committed = self.commit(&writer, |cache, batch| {
            for step in &moves {
                let moved = cache.relocate(&step.from, step.to.clone())?;
                batch.remove(step.from.clone());
                batch.upsert(moved);
            }
            Ok(())
        });

        if let Err(e) = committed {
            warn!("Organize commit failed, undoing {} moves: {}", moves.len(), e);
            for step in moves.iter().rev() {
                if let Err(undo) = tokio::fs::rename(&step.to, &step.from).await {
                    warn!("Could not restore {}: {}", step.from.display(), undo);
                }
            }
            self.broadcaster.publish(
                &op_id,
                ProgressSnapshot::new(OperationKind::Organize, ProgressStatus::Failed)
                    .with_message(e.to_string()),
            );
            return Err(e);
        }

        let status = if cancel.is_cancelled() {
            ProgressStatus::Cancelled
        } else {
            ProgressStatus::Completed
        };
        info!(
            "Organized {}: {} moved, {} in place, {} unsorted, {} errors",
            self.config.name,
            report.moved.len(),
            report.in_place,
            report.unsorted,
            report.errors.len()
        );
        self.broadcaster.publish(
            &op_id,
            ProgressSnapshot::new(OperationKind::Organize, status)
                .with_counts(total, total)
                .with_message(format!("{} moved", report.moved.len())),
        );
        Ok(report)
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Wait for in-flight mutations, then release the store and its lock.
    pub async fn close(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let store = self.store.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(store) = store {
            if let Err(e) = store.checkpoint() {
                warn!("WAL checkpoint on close failed: {}", e);
            }
            drop(store);
            info!("Closed library {}", self.config.name);
        }
        Ok(())
    }
}

fn normalize_tags(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Delete a model file; an already-missing file counts as deleted.
/// Fill in the saved roots when none were given, otherwise save the given set.
fn settle_roots(mut config: LibraryConfig, dir: &Path) -> Result<LibraryConfig> {
    let path = dir.join(StoreConfig::LIBRARY_FILENAME);
    let saved: Option<LibraryConfig> = read_json(&path)?;
    match saved {
        Some(saved) if config.roots.is_empty() => config.roots = saved.roots,
        Some(saved) if saved.roots == config.roots => {}
        _ if config.roots.is_empty() => {}
        saved => {
            if saved.is_some() {
                info!("Library {} has a new root set", config.name);
            }
            write_json(&path, &config)?;
        }
    }
    Ok(config)
}

/// Move a model file aside until its removal is committed.
///
/// Returns `None` when the file is already gone.
async fn stage_removal(path: &Path) -> Result<Option<PathBuf>> {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".deleting");
    let aside = PathBuf::from(aside);
    match tokio::fs::rename(path, &aside).await {
        Ok(()) => Ok(Some(aside)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} was already gone", path.display());
            Ok(None)
        }
        Err(e) => Err(ShelfError::io_with_path(e, path)),
    }
}

async fn finish_removal(aside: Option<PathBuf>) {
    if let Some(aside) = aside {
        if let Err(e) = tokio::fs::remove_file(&aside).await {
            warn!("Could not remove {}: {}", aside.display(), e);
        }
    }
}

async fn restore_removal(path: &Path, aside: Option<PathBuf>) {
    if let Some(aside) = aside {
        if let Err(e) = tokio::fs::rename(&aside, path).await {
            warn!("Could not restore {}: {}", path.display(), e);
        }
    }
}

async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ShelfError::io_with_path(e, parent))?;
    }
    tokio::fs::rename(from, to)
        .await
        .map_err(|e| ShelfError::io_with_path(e, from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ScriptedProvider;
    use crate::types::ModelKind;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        library: ModelLibrary,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("loras");
        std::fs::create_dir_all(&root).unwrap();
        let shelf = ShelfConfig::new(dir.path().join("data"));
        let config = LibraryConfig::new("main").with_root(&root, ModelKind::Lora);
        let library = ModelLibrary::open(config, &shelf, Arc::new(ProgressBroadcaster::default())).unwrap();
        Fixture {
            _dir: dir,
            root,
            library,
        }
    }

    fn with_base(_: &str) -> Result<Option<ModelMetadata>> {
        Ok(Some(ModelMetadata {
            provider: "scripted".into(),
            model_name: Some("Zeta Style".into()),
            base_model: Some("SDXL 1.0".into()),
            tags: vec!["Style".into()],
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_scan_then_tag_and_favorite() {
        let fx = fixture();
        let a = fx.root.join("a.safetensors");
        std::fs::write(&a, b"alpha").unwrap();

        let report = fx.library.scan(ScanMode::Full, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.added, 1);

        fx.library.add_tags(&a, &[" Anime ".into(), "".into()]).await.unwrap();
        fx.library.set_favorite(&a, true).await.unwrap();
        let record = fx.library.by_path(&a).unwrap();
        assert!(record.favorite);
        assert_eq!(record.tags.iter().collect::<Vec<_>>(), vec!["anime"]);

        fx.library.remove_tags(&a, &["ANIME".into()]).await.unwrap();
        assert!(fx.library.by_path(&a).unwrap().tags.is_empty());

        let op = fx.library.operation_id(OperationKind::Scan);
        assert_eq!(
            fx.library.broadcaster.latest(&op).unwrap().status,
            ProgressStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_rename_moves_file_and_record() {
        let fx = fixture();
        let a = fx.root.join("a.safetensors");
        std::fs::write(&a, b"alpha").unwrap();
        fx.library.scan(ScanMode::Full, &CancellationToken::new()).await.unwrap();

        let b = fx.root.join("sub/b.safetensors");
        let outcome = fx.library.rename(&a, &b).await.unwrap();
        assert_eq!(outcome.removed, vec![a.clone()]);
        assert!(b.exists());
        assert!(!a.exists());
        assert!(fx.library.by_path(&a).is_none());
        assert_eq!(fx.library.by_path(&b).unwrap().file_name, "b.safetensors");

        let outside = fx.root.join("c.txt");
        assert!(matches!(
            fx.library.rename(&b, &outside).await,
            Err(ShelfError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_bulk_delete_resorts_once() {
        let fx = fixture();
        let mut paths = Vec::new();
        for i in 0..5 {
            let path = fx.root.join(format!("m{}.safetensors", i));
            std::fs::write(&path, format!("content {}", i)).unwrap();
            paths.push(path);
        }
        fx.library.scan(ScanMode::Full, &CancellationToken::new()).await.unwrap();
        let before = fx.library.snapshot().resort_count();

        let mut targets = paths[..3].to_vec();
        targets.push(fx.root.join("unknown.safetensors"));
        let outcome = fx.library.bulk_delete(&targets).await.unwrap();

        assert_eq!(outcome.removed.len(), 3);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(fx.library.snapshot().len(), 2);
        assert_eq!(fx.library.snapshot().resort_count(), before + 1);
        assert!(!paths[0].exists());
    }

    #[tokio::test]
    async fn test_bulk_refresh_applies_metadata() {
        let fx = fixture();
        let a = fx.root.join("a.safetensors");
        std::fs::write(&a, b"alpha").unwrap();
        fx.library.scan(ScanMode::Full, &CancellationToken::new()).await.unwrap();

        let resolver = MetadataResolver::new(Duration::from_secs(1))
            .with_provider(Arc::new(ScriptedProvider::new("scripted", with_base)));
        let report = fx
            .library
            .bulk_refresh(&resolver, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.candidates, 1);
        assert_eq!(report.resolved, 1);
        assert_eq!(report.renamed, 1);
        assert!(report.resorted);
        let record = fx.library.by_path(&a).unwrap();
        assert_eq!(record.display_name, "Zeta Style");
        assert!(record.tags.contains("style"));
        assert_eq!(fx.library.base_models(), vec!["SDXL 1.0"]);

        let op = fx.library.operation_id(OperationKind::Refresh);
        let last = fx.library.broadcaster.latest(&op).unwrap();
        assert_eq!(last.status, ProgressStatus::Completed);
        assert_eq!((last.processed, last.total), (1, Some(1)));
    }

    #[tokio::test]
    async fn test_auto_organize_moves_into_base_model_folder() {
        let fx = fixture();
        let a = fx.root.join("a.safetensors");
        let b = fx.root.join("b.safetensors");
        std::fs::write(&a, b"alpha").unwrap();
        std::fs::write(&b, b"beta").unwrap();
        fx.library.scan(ScanMode::Full, &CancellationToken::new()).await.unwrap();
        fx.library
            .apply_metadata(&a, with_base("").unwrap().unwrap())
            .await
            .unwrap();

        let report = fx.library.auto_organize(&CancellationToken::new()).await.unwrap();
        let target = fx.root.join("SDXL 1.0/a.safetensors");
        assert_eq!(report.moved.len(), 1);
        assert_eq!(report.unsorted, 1);
        assert!(target.exists());
        assert!(fx.library.by_path(&target).is_some());

        let again = fx.library.auto_organize(&CancellationToken::new()).await.unwrap();
        assert!(again.moved.is_empty());
        assert_eq!(again.in_place, 1);
    }

    #[tokio::test]
    async fn test_closed_library_rejects_mutations() {
        let fx = fixture();
        fx.library.close().await.unwrap();
        assert!(fx.library.is_closed());
        assert!(matches!(
            fx.library.scan(ScanMode::Quick, &CancellationToken::new()).await,
            Err(ShelfError::Conflict(_))
        ));
    }
}
