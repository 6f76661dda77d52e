//! Durable state: the per-library SQLite store and atomic JSON files.

pub mod atomic;
mod sqlite;

pub use atomic::{read_json, write_json};
pub use sqlite::{PersistentStore, StoreBatch, StoredStat};
