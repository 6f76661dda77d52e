//! Streaming SHA-256 computation for model files.
//!
//! Files are read in fixed-size chunks on the blocking pool. The cancellation
//! token is checked before every chunk so a cancelled scan stops within one
//! chunk of I/O.

use crate::cancel::CancellationToken;
use crate::config::ScanConfig;
use crate::error::{Result, ShelfError};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Result of hashing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Lowercase hex SHA-256.
    pub sha256: String,
    /// Bytes actually read.
    pub size: u64,
}

/// Hash a file on the current thread.
pub fn compute_sha256(path: &Path, cancel: &CancellationToken) -> Result<FileDigest> {
    let mut file = std::fs::File::open(path).map_err(|e| ShelfError::io_with_path(e, path))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; ScanConfig::HASH_CHUNK_SIZE];
    let mut size: u64 = 0;

    loop {
        cancel.check()?;
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| ShelfError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        size += bytes_read as u64;
    }

    Ok(FileDigest {
        sha256: hex::encode(hasher.finalize()),
        size,
    })
}

/// Hash a file on the blocking pool.
pub async fn hash_file(path: impl Into<PathBuf>, cancel: CancellationToken) -> Result<FileDigest> {
    let path = path.into();
    tokio::task::spawn_blocking(move || compute_sha256(&path, &cancel))
        .await
        .map_err(|e| ShelfError::Other(format!("Hash computation task failed: {}", e)))?
}

/// Check a file against an expected SHA-256 (case-insensitive).
pub async fn verify_sha256(path: impl Into<PathBuf>, expected: &str) -> Result<bool> {
    let digest = hash_file(path, CancellationToken::new()).await?;
    Ok(digest.sha256.eq_ignore_ascii_case(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_compute_sha256() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        let digest = compute_sha256(file.path(), &CancellationToken::new()).unwrap();
        assert_eq!(digest.sha256, HELLO_SHA256);
        assert_eq!(digest.size, 11);
    }

    #[test]
    fn test_cancelled_before_first_chunk() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"data").unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = compute_sha256(file.path(), &token);
        assert!(matches!(result, Err(ShelfError::Cancelled)));
    }

    #[test]
    fn test_missing_file() {
        let result = compute_sha256(Path::new("/nonexistent/model.bin"), &CancellationToken::new());
        assert!(matches!(result, Err(ShelfError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_verify_sha256_case_insensitive() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        assert!(verify_sha256(file.path(), &HELLO_SHA256.to_uppercase())
            .await
            .unwrap());
        assert!(!verify_sha256(file.path(), "00").await.unwrap());
    }
}
