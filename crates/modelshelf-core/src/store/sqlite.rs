//! SQLite-backed durable mirror of a library cache.

use crate::config::StoreConfig;
use crate::error::{Result, ShelfError};
use crate::types::ModelRecord;
use fs2::FileExt;
use rusqlite::{params, Connection, Row};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const SCHEMA_VERSION: i32 = 1;

/// Upserts and removals applied in one transaction.
#[derive(Debug, Clone, Default)]
pub struct StoreBatch {
    pub upserts: Vec<ModelRecord>,
    pub removals: Vec<PathBuf>,
}

impl StoreBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    pub fn upsert(&mut self, record: ModelRecord) {
        self.upserts.push(record);
    }

    pub fn remove(&mut self, path: PathBuf) {
        self.removals.push(path);
    }

    /// Every path the batch touches.
    pub fn touched_paths(&self) -> Vec<PathBuf> {
        self.removals
            .iter()
            .cloned()
            .chain(self.upserts.iter().map(|r| r.path.clone()))
            .collect()
    }
}

/// Size and modification time as last recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredStat {
    pub size: u64,
    pub modified: i64,
}

/// Per-library SQLite store.
///
/// Holds an exclusive advisory lock on the library's lock file for its whole
/// lifetime, so only one process can write a library at a time.
pub struct PersistentStore {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    lock_file: File,
}

impl PersistentStore {
    /// Open (or create) the store in `dir`.
    ///
    /// Fails with [`ShelfError::LibraryLocked`] when another handle holds it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| ShelfError::io_with_path(e, dir))?;

        let lock_path = dir.join(StoreConfig::LOCK_FILENAME);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| ShelfError::io_with_path(e, &lock_path))?;
        if lock_file.try_lock_exclusive().is_err() {
            warn!("Library store {} is already open", dir.display());
            return Err(ShelfError::LibraryLocked(lock_path));
        }

        let db_path = dir.join(StoreConfig::DB_FILENAME);
        let conn = Connection::open(&db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;

        info!("Opened library store at {}", db_path.display());
        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
            lock_file,
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout={};
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
            StoreConfig::BUSY_TIMEOUT_MS
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(ShelfError::Database {
                message: format!(
                    "store schema version {} is newer than supported version {}",
                    version, SCHEMA_VERSION
                ),
                source: None,
            });
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS models (
                path TEXT PRIMARY KEY,
                hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                modified INTEGER NOT NULL,
                record_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_models_hash ON models(hash)",
            [],
        )?;
        conn.execute_batch(&format!("PRAGMA user_version={}", SCHEMA_VERSION))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| ShelfError::Database {
            message: "Failed to acquire connection lock".to_string(),
            source: None,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Apply a batch in a single transaction; nothing is written on error.
    pub fn apply(&self, batch: &StoreBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();
        {
            let mut delete = tx.prepare_cached("DELETE FROM models WHERE path = ?1")?;
            for path in &batch.removals {
                delete.execute(params![path_key(path)])?;
            }

            let mut upsert = tx.prepare_cached(
                "INSERT INTO models (path, hash, size, modified, record_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(path) DO UPDATE SET
                     hash=excluded.hash,
                     size=excluded.size,
                     modified=excluded.modified,
                     record_json=excluded.record_json,
                     updated_at=excluded.updated_at",
            )?;
            for record in &batch.upserts {
                let json = serde_json::to_string(record)?;
                upsert.execute(params![
                    path_key(&record.path),
                    record.hash,
                    record.size as i64,
                    record.modified,
                    json,
                    now,
                ])?;
            }
        }
        tx.commit()?;

        debug!(
            "Store applied {} upserts, {} removals",
            batch.upserts.len(),
            batch.removals.len()
        );
        Ok(())
    }

    /// Load every stored record.
    pub fn load_all(&self) -> Result<Vec<ModelRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT record_json FROM models ORDER BY path")?;
        let rows = stmt.query_map([], row_to_json)?;

        let mut records = Vec::new();
        for json in rows {
            let json = json?;
            match serde_json::from_str::<ModelRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable stored record: {}", e),
            }
        }
        Ok(records)
    }

    /// Records stored for a content hash.
    pub fn get_by_hash(&self, hash: &str) -> Result<Vec<ModelRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT record_json FROM models WHERE hash = ?1 ORDER BY path")?;
        let rows = stmt.query_map(params![hash], row_to_json)?;

        let mut records = Vec::new();
        for json in rows {
            records.push(serde_json::from_str(&json?)?);
        }
        Ok(records)
    }

    /// Size and mtime per stored path, for drift detection.
    pub fn stats(&self) -> Result<HashMap<PathBuf, StoredStat>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT path, size, modified FROM models")?;
        let rows = stmt.query_map([], |row| {
            let path: String = row.get(0)?;
            let size: i64 = row.get(1)?;
            let modified: i64 = row.get(2)?;
            Ok((
                PathBuf::from(path),
                StoredStat {
                    size: size as u64,
                    modified,
                },
            ))
        })?;

        let mut stats = HashMap::new();
        for row in rows {
            let (path, stat) = row?;
            stats.insert(path, stat);
        }
        Ok(stats)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM models", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Fold the WAL back into the main database file.
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock_file) {
            warn!("Failed to release store lock for {}: {}", self.db_path.display(), e);
        }
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn row_to_json(row: &Row<'_>) -> rusqlite::Result<String> {
    row.get(0)
}
