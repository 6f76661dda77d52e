//! Local SQLite archive of model metadata.
//!
//! Expected tables:
//!
//! ```sql
//! models(id INTEGER PRIMARY KEY, name TEXT, description TEXT, tags TEXT)
//! model_versions(id INTEGER PRIMARY KEY, model_id INTEGER, name TEXT,
//!                base_model TEXT, trained_words TEXT, download_url TEXT, data TEXT)
//! model_files(sha256 TEXT, version_id INTEGER)
//! ```
//!
//! `tags` and `trained_words` hold JSON string arrays; `data` holds the raw
//! version payload when the archive kept one.

use crate::error::{Result, ShelfError};
use crate::metadata::provider::{string_list, MetadataProvider};
use crate::types::ModelMetadata;
use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

const LOOKUP_SQL: &str = "
    SELECT v.id, v.model_id, v.name, v.base_model, v.trained_words, v.download_url, v.data,
           m.name, m.description, m.tags
    FROM model_files f
    JOIN model_versions v ON v.id = f.version_id
    LEFT JOIN models m ON m.id = v.model_id
    WHERE f.sha256 = ?1 COLLATE NOCASE
    LIMIT 1";

pub struct ArchiveDbProvider {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl ArchiveDbProvider {
    /// Open the archive read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(ShelfError::FileNotFound(path));
        }
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lookup(conn: &Connection, sha256: &str) -> Result<Option<ModelMetadata>> {
    let row = conn
        .query_row(LOOKUP_SQL, params![sha256], |row| {
            Ok((
                row.get::<_, Option<i64>>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
            ))
        })
        .optional()?;

    let Some((version_id, model_id, version_name, base_model, words, url, data, name, desc, tags)) =
        row
    else {
        return Ok(None);
    };

    let parse_list = |json: Option<String>| {
        json.and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            .map(|v| string_list(Some(&v)))
            .unwrap_or_default()
    };

    let metadata = ModelMetadata {
        provider: "archive".to_string(),
        model_id: model_id.map(|id| id as u64),
        version_id: version_id.map(|id| id as u64),
        model_name: name,
        version_name,
        base_model,
        trained_words: parse_list(words),
        description: desc,
        tags: parse_list(tags),
        download_url: url,
        raw: data
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null),
    };
    Ok((!metadata.is_empty()).then_some(metadata))
}

#[async_trait]
impl MetadataProvider for ArchiveDbProvider {
    fn name(&self) -> &str {
        "archive"
    }

    async fn fetch(&self, sha256: &str) -> Result<Option<ModelMetadata>> {
        let conn = self.conn.clone();
        let sha256 = sha256.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| ShelfError::Database {
                message: "Failed to acquire connection lock".to_string(),
                source: None,
            })?;
            lookup(&conn, &sha256)
        })
        .await
        .map_err(|e| ShelfError::Other(format!("Archive lookup task failed: {}", e)))??;

        if result.is_none() {
            debug!("Archive has no entry for hash");
        }
        Ok(result)
    }
}
