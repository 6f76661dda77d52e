//! Results returned by library operations.

use crate::scanner::ScanReport;
use crate::types::ModelRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A per-item failure collected instead of aborting a bulk call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub path: PathBuf,
    pub message: String,
}

impl ItemError {
    pub fn new(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// What a committed mutation changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationOutcome {
    /// Records as stored after the mutation.
    pub updated: Vec<ModelRecord>,
    pub removed: Vec<PathBuf>,
    /// Whether the snapshot order was rebuilt.
    pub resorted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ItemError>,
}

impl MutationOutcome {
    pub fn is_noop(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Stat-only comparison of disk against the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drift {
    pub added: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
    pub changed: Vec<PathBuf>,
}

impl Drift {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.missing.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub drift: Drift,
    /// Present when drift (or a forced run) triggered a scan.
    pub scan: Option<ScanReport>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Records that lacked metadata when the refresh started.
    pub candidates: usize,
    pub resolved: usize,
    /// Hashes no provider knew.
    pub unavailable: Vec<String>,
    /// Records moved, deleted or rehashed while providers were queried.
    pub stale: usize,
    pub renamed: usize,
    pub resorted: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizeMove {
    pub from: PathBuf,
    pub to: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrganizeReport {
    pub moved: Vec<OrganizeMove>,
    /// Already in their base-model folder.
    pub in_place: usize,
    /// No base model known.
    pub unsorted: usize,
    pub errors: Vec<ItemError>,
}
