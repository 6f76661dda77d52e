//! Download job model.

use crate::config::ScanConfig;
use crate::error::{Result, ShelfError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// How a source authenticates.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    None,
    /// `Authorization: Bearer <token>`.
    Bearer { token: String },
    /// `?<param>=<token>` appended to the URL.
    QueryToken { param: String, token: String },
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::None => write!(f, "None"),
            AuthMode::Bearer { .. } => write!(f, "Bearer(***)"),
            AuthMode::QueryToken { param, .. } => write!(f, "QueryToken({}=***)", param),
        }
    }
}

/// Where a download comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSource {
    pub url: String,
    #[serde(default)]
    pub auth: AuthMode,
}

impl DownloadSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: AuthMode::None,
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.auth = AuthMode::Bearer {
            token: token.into(),
        };
        self
    }

    pub fn with_query_token(mut self, param: impl Into<String>, token: impl Into<String>) -> Self {
        self.auth = AuthMode::QueryToken {
            param: param.into(),
            token: token.into(),
        };
        self
    }

    /// The URL to request, with any query token applied.
    pub fn request_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url).map_err(|e| ShelfError::Validation {
            field: "url".into(),
            message: format!("'{}' is not a valid URL: {}", self.url, e),
        })?;
        if let AuthMode::QueryToken { param, token } = &self.auth {
            url.query_pairs_mut().append_pair(param, token);
        }
        Ok(url)
    }
}

/// Options for [`crate::download::DownloadCoordinator::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Verify the finished file against this SHA-256 before completing.
    pub expected_sha256: Option<String>,
    /// Replace an existing destination file.
    pub overwrite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Queued,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Cancelled | DownloadState::Failed
        )
    }

    /// Whether a job in this state owns its destination's partial file.
    pub fn holds_destination(&self) -> bool {
        matches!(
            self,
            DownloadState::Queued
                | DownloadState::Downloading
                | DownloadState::Paused
                | DownloadState::Failed
        )
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DownloadState::Queued => "queued",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Completed => "completed",
            DownloadState::Cancelled => "cancelled",
            DownloadState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// What the remote said about the resource; a change means the partial file
/// belongs to different content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

impl RemoteIdentity {
    /// Compare on the strongest validator both sides carry.
    pub fn matches(&self, other: &RemoteIdentity) -> bool {
        if let (Some(a), Some(b)) = (&self.etag, &other.etag) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (&self.last_modified, &other.last_modified) {
            if a != b {
                return false;
            }
        }
        match (self.length, other.length) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Last confirmed offset plus the identity it was confirmed against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub offset: u64,
    #[serde(default)]
    pub identity: RemoteIdentity,
}

/// Internal, persisted view of a job. Carries credentials, so callers get a
/// [`DownloadSnapshot`] instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub source: DownloadSource,
    pub destination: PathBuf,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub received_bytes: u64,
    #[serde(default)]
    pub resume: Option<ResumeToken>,
    pub state: DownloadState,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub post_process_error: Option<String>,
    #[serde(default)]
    pub pause_requested: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub expected_sha256: Option<String>,
    #[serde(default)]
    pub record_hash: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DownloadJob {
    pub fn new(source: DownloadSource, destination: PathBuf, options: &StartOptions) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            destination,
            total_bytes: None,
            received_bytes: 0,
            resume: None,
            state: DownloadState::Queued,
            error: None,
            error_kind: None,
            post_process_error: None,
            pause_requested: false,
            attempts: 0,
            expected_sha256: options.expected_sha256.clone(),
            record_hash: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// `<destination>.part`
    pub fn part_path(&self) -> PathBuf {
        let mut name = self.destination.as_os_str().to_owned();
        name.push(ScanConfig::PARTIAL_SUFFIX);
        PathBuf::from(name)
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            id: self.id.clone(),
            url: self.source.url.clone(),
            destination: self.destination.clone(),
            state: self.state,
            total_bytes: self.total_bytes,
            received_bytes: self.received_bytes,
            error: self.error.clone(),
            error_kind: self.error_kind.clone(),
            post_process_error: self.post_process_error.clone(),
            pause_requested: self.pause_requested,
            attempts: self.attempts,
            record_hash: self.record_hash.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

/// Caller-facing job status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: String,
    pub url: String,
    pub destination: PathBuf,
    pub state: DownloadState,
    pub total_bytes: Option<u64>,
    pub received_bytes: u64,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    /// Failure of the scan/resolve/insert chain after a completed transfer.
    pub post_process_error: Option<String>,
    pub pause_requested: bool,
    pub attempts: u32,
    /// Content hash of the catalogued record once post-processing succeeds.
    pub record_hash: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DownloadSnapshot {
    pub fn progress(&self) -> Option<f64> {
        self.total_bytes
            .filter(|total| *total > 0)
            .map(|total| self.received_bytes as f64 / total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_url_appends_query_token() {
        let source = DownloadSource::new("https://example.com/file?type=Model")
            .with_query_token("token", "s3cret");
        let url = source.request_url().unwrap();
        assert_eq!(url.as_str(), "https://example.com/file?type=Model&token=s3cret");
    }

    #[test]
    fn test_invalid_url_is_validation_error() {
        let result = DownloadSource::new("not a url").request_url();
        assert!(matches!(result, Err(ShelfError::Validation { .. })));
    }

    #[test]
    fn test_auth_debug_redacts_tokens() {
        let source = DownloadSource::new("https://x").with_bearer("s3cret");
        assert!(!format!("{:?}", source).contains("s3cret"));
    }

    #[test]
    fn test_part_path() {
        let job = DownloadJob::new(
            DownloadSource::new("https://x/a"),
            PathBuf::from("/m/model.safetensors"),
            &StartOptions::default(),
        );
        assert_eq!(job.part_path(), PathBuf::from("/m/model.safetensors.part"));
        assert_eq!(job.state, DownloadState::Queued);
    }

    #[test]
    fn test_identity_matching() {
        let a = RemoteIdentity {
            etag: Some("\"v1\"".into()),
            last_modified: None,
            length: Some(10),
        };
        let mut b = a.clone();
        assert!(a.matches(&b));
        b.etag = Some("\"v2\"".into());
        assert!(!a.matches(&b));

        let len_only = RemoteIdentity {
            length: Some(11),
            ..Default::default()
        };
        assert!(!a.matches(&len_only));
        assert!(a.matches(&RemoteIdentity::default()));
    }
}
