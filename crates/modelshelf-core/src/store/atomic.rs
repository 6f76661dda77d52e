//! Crash-safe JSON files.
//!
//! Writes go to a sibling temp file (PID + thread suffix), are validated,
//! fsynced and then renamed over the target, so a reader sees either the old
//! or the new document and never a torn one.

use crate::error::{Result, ShelfError};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read and parse a JSON file; `None` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ShelfError::io_with_path(e, path)),
    };

    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| ShelfError::Json {
            message: format!("Failed to parse {}: {}", path.display(), e),
            source: Some(e),
        })
}

/// Replace `path` with the JSON encoding of `data`.
pub fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ShelfError::io_with_path(e, parent))?;
    }

    let serialized = serde_json::to_string_pretty(data)?;
    serde_json::from_str::<serde_json::Value>(&serialized).map_err(|e| ShelfError::Json {
        message: format!("JSON validation failed: {}", e),
        source: Some(e),
    })?;

    let temp_path = temp_path_for(path);
    let written = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(serialized.as_bytes())?;
        file.flush()?;
        file.sync_all()
    })();

    if let Err(e) = written.and_then(|_| fs::rename(&temp_path, path)) {
        let _ = fs::remove_file(&temp_path);
        return Err(ShelfError::io_with_path(e, path));
    }

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    path.with_extension(format!(
        "json.{}.{:x}.tmp",
        std::process::id(),
        hasher.finish()
    ))
}
