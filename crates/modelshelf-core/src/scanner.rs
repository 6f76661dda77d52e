//! Filesystem scanning.
//!
//! A scan is a stat pass over every library root followed by hashing of the
//! files that need it. The result is a [`ScanOutcome`] describing upserts and
//! removals; nothing is applied here, the library writer commits the batch.

use crate::cache::LibraryCache;
use crate::cancel::CancellationToken;
use crate::config::{deepest_root, LibraryRoot, ScanConfig};
use crate::error::{Result, ShelfError};
use crate::hashing::hash_file;
use crate::store::StoreBatch;
use crate::types::{ModelKind, ModelRecord};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Reuse cached hashes when path, size and mtime are unchanged.
    Quick,
    /// Rehash every file.
    Full,
}

/// Stat-only view of one candidate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: PathBuf,
    pub size: u64,
    pub modified: i64,
    pub kind: ModelKind,
}

/// A file or directory the scan had to skip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanIssue {
    pub path: PathBuf,
    pub message: String,
}

/// Result of walking the roots without reading file content.
#[derive(Debug, Default)]
pub struct StatPass {
    pub files: Vec<FileStat>,
    pub issues: Vec<ScanIssue>,
    /// Directories that could not be listed; records under them are kept.
    pub unreadable: Vec<PathBuf>,
}

impl StatPass {
    pub fn covers_unreadable(&self, path: &Path) -> bool {
        self.unreadable.iter().any(|dir| path.starts_with(dir))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub mode: ScanMode,
    pub files_seen: usize,
    pub hashed: usize,
    pub unchanged: usize,
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    pub errors: Vec<ScanIssue>,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub batch: StoreBatch,
    pub report: ScanReport,
}

/// Called with `(processed, total)` as files are hashed.
pub type ScanProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FileScanner {
    roots: Vec<LibraryRoot>,
}

impl FileScanner {
    pub fn new(roots: Vec<LibraryRoot>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[LibraryRoot] {
        &self.roots
    }

    /// Owning root kind and catalogue eligibility for `path`.
    pub(crate) fn eligible_kind(&self, path: &Path) -> Option<ModelKind> {
        if is_partial(path) {
            return None;
        }
        let root = deepest_root(&self.roots, path)?;
        root.kind.descriptor().accepts(path).then_some(root.kind)
    }

    /// Walk every root collecting candidate files. Blocking.
    pub fn stat_pass(&self) -> StatPass {
        let mut pass = StatPass::default();
        let mut seen = HashSet::new();

        for root in &self.roots {
            if !root.path.is_dir() {
                warn!("Library root {} is not a readable directory", root.path.display());
                pass.issues.push(ScanIssue {
                    path: root.path.clone(),
                    message: "root is not a readable directory".into(),
                });
                pass.unreadable.push(root.path.clone());
                continue;
            }

            for entry in WalkDir::new(&root.path).follow_links(true) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.path.clone());
                        warn!("Skipping unreadable entry {}: {}", path.display(), e);
                        pass.issues.push(ScanIssue {
                            path: path.clone(),
                            message: e.to_string(),
                        });
                        pass.unreadable.push(path);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }

                let path = entry.path();
                let Some(kind) = self.eligible_kind(path) else {
                    continue;
                };
                if !seen.insert(path.to_path_buf()) {
                    continue;
                }
                if path.to_str().is_none() {
                    pass.issues.push(ScanIssue {
                        path: path.to_path_buf(),
                        message: "path is not valid UTF-8".into(),
                    });
                    continue;
                }

                match entry.metadata() {
                    Ok(meta) => pass.files.push(FileStat {
                        path: path.to_path_buf(),
                        size: meta.len(),
                        modified: meta.modified().map(unix_seconds).unwrap_or(0),
                        kind,
                    }),
                    Err(e) => {
                        debug!("Cannot stat {}: {}", path.display(), e);
                        pass.issues.push(ScanIssue {
                            path: path.to_path_buf(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        pass.files.sort_by(|a, b| a.path.cmp(&b.path));
        pass
    }

    /// Compare the filesystem against `existing` and describe the changes.
    ///
    /// Cancellation discards all work and returns [`ShelfError::Cancelled`].
    pub async fn scan(
        &self,
        existing: &LibraryCache,
        mode: ScanMode,
        cancel: &CancellationToken,
        on_progress: Option<ScanProgressFn>,
    ) -> Result<ScanOutcome> {
        let started = Instant::now();
        info!("Starting {:?} scan over {} roots", mode, self.roots.len());

        let scanner = self.clone();
        let pass = tokio::task::spawn_blocking(move || scanner.stat_pass())
            .await
            .map_err(|e| ShelfError::Other(format!("Stat pass task failed: {}", e)))?;
        cancel.check()?;

        let mut report = ScanReport {
            mode,
            files_seen: pass.files.len(),
            hashed: 0,
            unchanged: 0,
            added: 0,
            changed: 0,
            removed: 0,
            errors: pass.issues.clone(),
            duration_ms: 0,
        };
        let mut batch = StoreBatch::default();

        let mut to_hash = Vec::new();
        for stat in &pass.files {
            let previous = existing.by_path(&stat.path).cloned();
            match previous {
                Some(prev)
                    if mode == ScanMode::Quick
                        && prev.size == stat.size
                        && prev.modified == stat.modified =>
                {
                    report.unchanged += 1;
                }
                prev => to_hash.push((stat.clone(), prev)),
            }
        }

        let total = to_hash.len();
        let mut hashed = stream::iter(to_hash.into_iter().map(|(stat, prev)| {
            let cancel = cancel.clone();
            async move {
                let digest = hash_file(stat.path.clone(), cancel).await;
                (stat, prev, digest)
            }
        }))
        .buffer_unordered(ScanConfig::HASH_CONCURRENCY);

        let mut processed = 0;
        let mut upserts = Vec::new();
        while let Some((stat, prev, digest)) = hashed.next().await {
            processed += 1;
            if let Some(callback) = &on_progress {
                if processed % ScanConfig::PROGRESS_EVERY == 0 || processed == total {
                    callback(processed, total);
                }
            }

            let digest = match digest {
                Ok(digest) => digest,
                Err(ShelfError::Cancelled) => return Err(ShelfError::Cancelled),
                Err(e) => {
                    warn!("Skipping {}: {}", stat.path.display(), e);
                    report.errors.push(ScanIssue {
                        path: stat.path.clone(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            report.hashed += 1;

            match prev {
                Some(prev) if prev.hash == digest.sha256 => {
                    if prev.size == stat.size && prev.modified == stat.modified {
                        report.unchanged += 1;
                    } else {
                        let mut record = prev;
                        record.size = stat.size;
                        record.modified = stat.modified;
                        upserts.push(record);
                        report.changed += 1;
                    }
                }
                Some(prev) => {
                    debug!("Content of {} changed", stat.path.display());
                    upserts.push(rehashed(prev, &stat, digest.sha256));
                    report.changed += 1;
                }
                None => {
                    upserts.push(new_record(&stat, digest.sha256));
                    report.added += 1;
                }
            }
        }
        drop(hashed);
        cancel.check()?;

        upserts.sort_by(|a, b| a.path.cmp(&b.path));
        batch.upserts = upserts;

        let on_disk: HashSet<&Path> = pass.files.iter().map(|f| f.path.as_path()).collect();
        for record in existing.iter() {
            let still_owned = deepest_root(&self.roots, &record.path).is_some();
            if on_disk.contains(record.path.as_path()) {
                continue;
            }
            if still_owned && pass.covers_unreadable(&record.path) {
                continue;
            }
            batch.remove(record.path.clone());
            report.removed += 1;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Scan complete: {} seen, {} hashed, {} added, {} changed, {} removed, {} errors",
            report.files_seen,
            report.hashed,
            report.added,
            report.changed,
            report.removed,
            report.errors.len()
        );
        Ok(ScanOutcome { batch, report })
    }

    /// Hash a single file and build its record.
    ///
    /// User fields of `existing` are carried over; its metadata survives only
    /// if the content is unchanged.
    pub async fn scan_file(&self, path: &Path, existing: Option<&ModelRecord>) -> Result<ModelRecord> {
        let kind = self.eligible_kind(path).ok_or_else(|| ShelfError::Validation {
            field: "path".into(),
            message: format!("{} is not a catalogued model file of this library", path.display()),
        })?;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| ShelfError::io_with_path(e, path))?;
        let stat = FileStat {
            path: path.to_path_buf(),
            size: meta.len(),
            modified: meta.modified().map(unix_seconds).unwrap_or(0),
            kind,
        };

        let digest = hash_file(path, CancellationToken::new()).await?;
        let record = match existing {
            Some(prev) if prev.hash == digest.sha256 => {
                let mut record = prev.clone();
                record.size = stat.size;
                record.modified = stat.modified;
                record
            }
            Some(prev) => rehashed(prev.clone(), &stat, digest.sha256),
            None => new_record(&stat, digest.sha256),
        };
        Ok(record)
    }
}

/// Whether `path` is an in-flight download.
pub fn is_partial(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(ScanConfig::PARTIAL_SUFFIX))
        .unwrap_or(false)
}

pub(crate) fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

fn new_record(stat: &FileStat, hash: String) -> ModelRecord {
    let descriptor = stat.kind.descriptor();
    ModelRecord {
        hash,
        file_name: stat
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        display_name: descriptor.display_name(&stat.path, None),
        path: stat.path.clone(),
        size: stat.size,
        modified: stat.modified,
        kind: stat.kind,
        metadata: None,
        tags: BTreeSet::new(),
        favorite: false,
        excluded: false,
        added_at: chrono::Utc::now().to_rfc3339(),
    }
}

/// Same path, new content: provider metadata no longer applies.
fn rehashed(mut record: ModelRecord, stat: &FileStat, hash: String) -> ModelRecord {
    record.hash = hash;
    record.size = stat.size;
    record.modified = stat.modified;
    record.kind = stat.kind;
    record.metadata = None;
    record.display_name = stat.kind.descriptor().display_name(&stat.path, None);
    record
}
