//! Download persistence for restart resume.
//!
//! Jobs that still own a partial file (queued, downloading, paused, failed)
//! are written to `downloads.json`; completed and cancelled jobs are removed.

use crate::download::types::DownloadJob;
use crate::error::Result;
use crate::store::{read_json, write_json};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct DownloadStoreData {
    downloads: Vec<DownloadJob>,
}

/// Manages `downloads.json`.
pub struct DownloadPersistence {
    path: PathBuf,
    /// Serializes read-modify-write cycles between job tasks.
    write_lock: Mutex<()>,
}

impl DownloadPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert a job by id.
    pub fn save(&self, job: &DownloadJob) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut data = self.load_data();
        if let Some(existing) = data.downloads.iter_mut().find(|d| d.id == job.id) {
            *existing = job.clone();
        } else {
            data.downloads.push(job.clone());
        }
        self.write_data(&data)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut data = self.load_data();
        let before = data.downloads.len();
        data.downloads.retain(|d| d.id != id);
        if data.downloads.len() < before {
            self.write_data(&data)?;
        }
        Ok(())
    }

    pub fn load_all(&self) -> Vec<DownloadJob> {
        self.load_data().downloads
    }

    /// Read store data, returning empty on any error.
    fn load_data(&self) -> DownloadStoreData {
        match read_json::<DownloadStoreData>(&self.path) {
            Ok(Some(data)) => data,
            Ok(None) => DownloadStoreData::default(),
            Err(e) => {
                warn!("Failed to read download store at {}: {}", self.path.display(), e);
                DownloadStoreData::default()
            }
        }
    }

    fn write_data(&self, data: &DownloadStoreData) -> Result<()> {
        debug!("Writing {} downloads to {}", data.downloads.len(), self.path.display());
        write_json(&self.path, data)
    }
}
