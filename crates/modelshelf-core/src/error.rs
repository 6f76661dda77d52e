//! Error types for the ModelShelf engine.
//!
//! Every fallible operation in the crate returns [`Result`]. Per-item failures
//! during scans, bulk refreshes and organize runs are collected into reports
//! instead of being raised; the variants here describe failures of a whole
//! call.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the ModelShelf engine.
#[derive(Debug, Error)]
pub enum ShelfError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Rate limited by {service}")]
    RateLimited { service: String },

    #[error("Circuit breaker open for {provider}")]
    CircuitBreakerOpen { provider: String },

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Library store is locked by another process: {0}")]
    LibraryLocked(PathBuf),

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Cache errors
    #[error("Cache consistency violated: {message}")]
    CacheConsistency { message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    // Metadata provider errors
    #[error("Provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    // Download errors
    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Unsupported download source: {0}")]
    UnsupportedSource(String),

    #[error("Download paused")]
    DownloadPaused,

    #[error("Operation cancelled")]
    Cancelled,

    // Concurrency errors
    #[error("Conflict: {0}")]
    Conflict(String),

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for ModelShelf operations.
pub type Result<T> = std::result::Result<T, ShelfError>;

impl From<std::io::Error> for ShelfError {
    fn from(err: std::io::Error) -> Self {
        ShelfError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ShelfError {
    fn from(err: serde_json::Error) -> Self {
        ShelfError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for ShelfError {
    fn from(err: rusqlite::Error) -> Self {
        ShelfError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for ShelfError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ShelfError::Timeout(Duration::from_secs(0))
        } else if let Some(status) = err.status() {
            ShelfError::HttpStatus {
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
                status: status.as_u16(),
            }
        } else {
            ShelfError::Network {
                message: err.to_string(),
                cause: Some(err.to_string()),
            }
        }
    }
}

impl ShelfError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            return ShelfError::FileNotFound(path);
        }
        ShelfError::Io {
            message: err.to_string(),
            path: Some(path),
            source: Some(err),
        }
    }

    /// Shorthand for a cache consistency failure.
    pub fn consistency(message: impl Into<String>) -> Self {
        ShelfError::CacheConsistency {
            message: message.into(),
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// Covers connection failures, timeouts, throttling and server-side
    /// (5xx) statuses plus 408. Other 4xx statuses are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            ShelfError::Network { .. }
            | ShelfError::Timeout(_)
            | ShelfError::RateLimited { .. } => true,
            ShelfError::HttpStatus { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// Stable machine-readable kind, used in snapshots and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ShelfError::Network { .. }
            | ShelfError::Timeout(_)
            | ShelfError::HttpStatus { .. }
            | ShelfError::RateLimited { .. }
            | ShelfError::CircuitBreakerOpen { .. } => "network",
            ShelfError::Database { .. } | ShelfError::LibraryLocked(_) => "store",
            ShelfError::Io { .. } | ShelfError::FileNotFound(_) => "filesystem",
            ShelfError::Json { .. } => "serialization",
            ShelfError::CacheConsistency { .. } => "consistency",
            ShelfError::NotFound(_) => "not_found",
            ShelfError::ProviderUnavailable { .. } => "provider",
            ShelfError::DownloadFailed { .. } | ShelfError::UnsupportedSource(_) => "download",
            ShelfError::DownloadPaused => "paused",
            ShelfError::Cancelled => "cancelled",
            ShelfError::Conflict(_) => "conflict",
            ShelfError::Config { .. } | ShelfError::Validation { .. } => "invalid",
            ShelfError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShelfError::Conflict("destination busy".into());
        assert_eq!(err.to_string(), "Conflict: destination busy");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ShelfError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(ShelfError::HttpStatus {
            url: "http://x".into(),
            status: 503
        }
        .is_retryable());
        assert!(ShelfError::HttpStatus {
            url: "http://x".into(),
            status: 429
        }
        .is_retryable());
        assert!(!ShelfError::HttpStatus {
            url: "http://x".into(),
            status: 404
        }
        .is_retryable());
        assert!(!ShelfError::Conflict("x".into()).is_retryable());
    }

    #[test]
    fn test_not_found_io_maps_to_file_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let mapped = ShelfError::io_with_path(err, "/tmp/a.bin");
        assert!(matches!(mapped, ShelfError::FileNotFound(_)));
        assert_eq!(mapped.kind(), "filesystem");
    }
}
