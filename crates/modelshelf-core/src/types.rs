//! Core data types shared by the library engine.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

// ========================================
// Model kinds
// ========================================

/// The kind of model a library root holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Lora,
    Checkpoint,
    Embedding,
}

/// Capability record for a [`ModelKind`].
#[derive(Debug, Clone, Copy)]
pub struct KindDescriptor {
    pub kind: ModelKind,
    pub label: &'static str,
    /// Lowercase extensions, without the dot.
    pub extensions: &'static [&'static str],
}

const LORA: KindDescriptor = KindDescriptor {
    kind: ModelKind::Lora,
    label: "LoRA",
    extensions: &["safetensors", "pt", "bin"],
};

const CHECKPOINT: KindDescriptor = KindDescriptor {
    kind: ModelKind::Checkpoint,
    label: "Checkpoint",
    extensions: &[
        "safetensors",
        "ckpt",
        "pt",
        "pt2",
        "pth",
        "bin",
        "pkl",
        "sft",
        "gguf",
    ],
};

const EMBEDDING: KindDescriptor = KindDescriptor {
    kind: ModelKind::Embedding,
    label: "Embedding",
    extensions: &["safetensors", "ckpt", "pt", "pt2", "pth", "bin", "pkl"],
};

impl ModelKind {
    pub fn descriptor(&self) -> &'static KindDescriptor {
        match self {
            ModelKind::Lora => &LORA,
            ModelKind::Checkpoint => &CHECKPOINT,
            ModelKind::Embedding => &EMBEDDING,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Lora => "lora",
            ModelKind::Checkpoint => "checkpoint",
            ModelKind::Embedding => "embedding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "lora" | "loras" => Some(ModelKind::Lora),
            "checkpoint" | "checkpoints" => Some(ModelKind::Checkpoint),
            "embedding" | "embeddings" => Some(ModelKind::Embedding),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.descriptor().label)
    }
}

impl KindDescriptor {
    /// Whether `path` has an extension this kind catalogues.
    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }

    /// Display name for a file: provider model name when known, else the stem.
    pub fn display_name(&self, path: &Path, metadata: Option<&ModelMetadata>) -> String {
        if let Some(name) = metadata.and_then(|m| m.model_name.as_deref()) {
            let name = name.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

// ========================================
// Records
// ========================================

/// Provider-sourced model metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,
    #[serde(default)]
    pub trained_words: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl ModelMetadata {
    /// A payload with no identifying field counts as "no result".
    pub fn is_empty(&self) -> bool {
        self.model_id.is_none()
            && self.version_id.is_none()
            && self.model_name.is_none()
            && self.base_model.is_none()
    }
}

/// A catalogued model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Lowercase hex SHA-256 of the file content.
    pub hash: String,
    pub path: PathBuf,
    pub file_name: String,
    pub display_name: String,
    pub size: u64,
    /// Modification time, unix seconds.
    pub modified: i64,
    pub kind: ModelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ModelMetadata>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub excluded: bool,
    /// RFC 3339 timestamp of first cataloguing.
    pub added_at: String,
}

impl ModelRecord {
    pub fn base_model(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.base_model.as_deref())
    }

    /// Replace metadata and re-derive the display name.
    ///
    /// Returns true when the display name changed.
    pub fn set_metadata(&mut self, metadata: ModelMetadata) -> bool {
        let display_name = self
            .kind
            .descriptor()
            .display_name(&self.path, Some(&metadata));
        for tag in &metadata.tags {
            self.tags.insert(tag.to_lowercase());
        }
        self.metadata = Some(metadata);
        let changed = display_name != self.display_name;
        self.display_name = display_name;
        changed
    }

    /// Point the record at a new path, keeping provider naming.
    pub fn relocate(&mut self, path: PathBuf) {
        self.file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.display_name = self
            .kind
            .descriptor()
            .display_name(&path, self.metadata.as_ref());
        self.path = path;
    }
}

// ========================================
// Ordering and filtering
// ========================================

/// Field a cache snapshot is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Name,
    Date,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortOrder {
    pub key: SortKey,
    #[serde(default)]
    pub descending: bool,
}

impl SortOrder {
    pub fn new(key: SortKey, descending: bool) -> Self {
        Self { key, descending }
    }

    /// Parse `name`, `date:desc`, `size:asc` and friends.
    pub fn parse(s: &str) -> Option<Self> {
        let (key, dir) = s.split_once(':').unwrap_or((s, "asc"));
        let key = match key.to_lowercase().as_str() {
            "name" => SortKey::Name,
            "date" => SortKey::Date,
            "size" => SortKey::Size,
            _ => return None,
        };
        let descending = match dir.to_lowercase().as_str() {
            "asc" => false,
            "desc" => true,
            _ => return None,
        };
        Some(Self { key, descending })
    }

    /// Total order over records; ties break on path so pages are stable.
    pub fn compare(&self, a: &ModelRecord, b: &ModelRecord) -> Ordering {
        let primary = match self.key {
            SortKey::Name => a
                .display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase()),
            SortKey::Date => a.modified.cmp(&b.modified),
            SortKey::Size => a.size.cmp(&b.size),
        };
        let primary = if self.descending {
            primary.reverse()
        } else {
            primary
        };
        primary.then_with(|| a.path.cmp(&b.path))
    }
}

/// Query filter for [`crate::cache::LibraryCache::page`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Case-insensitive substring of the display or file name.
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub kinds: Vec<ModelKind>,
    /// Every listed tag must be present.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Any listed base model matches.
    #[serde(default)]
    pub base_models: Vec<String>,
    #[serde(default)]
    pub favorites_only: bool,
    #[serde(default)]
    pub include_excluded: bool,
}

impl RecordFilter {
    pub fn matches(&self, record: &ModelRecord) -> bool {
        if record.excluded && !self.include_excluded {
            return false;
        }
        if self.favorites_only && !record.favorite {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind) {
            return false;
        }
        if !self
            .tags
            .iter()
            .all(|tag| record.tags.contains(&tag.to_lowercase()))
        {
            return false;
        }
        if !self.base_models.is_empty() {
            match record.base_model() {
                Some(base) if self.base_models.iter().any(|b| b == base) => {}
                _ => return false,
            }
        }
        if let Some(search) = self.search.as_deref() {
            let needle = search.to_lowercase();
            if !record.display_name.to_lowercase().contains(&needle)
                && !record.file_name.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

/// One page of records plus the total match count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<ModelRecord>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }
}
