//! In-memory library cache.

mod library_cache;

pub use library_cache::{LibraryCache, TagCount};
