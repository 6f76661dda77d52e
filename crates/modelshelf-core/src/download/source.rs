//! Byte sources for the download coordinator.

use crate::download::types::{AuthMode, RemoteIdentity};
use crate::error::{Result, ShelfError};
use crate::network::transfer_client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_RANGE, ETAG, IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

/// One ranged fetch.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Fully-formed URL, query token already applied.
    pub url: Url,
    pub auth: AuthMode,
    /// First byte wanted; 0 requests the whole resource.
    pub offset: u64,
    /// Identity the partial file was written against, sent as `If-Range`.
    pub validator: Option<RemoteIdentity>,
}

pub struct TransferResponse {
    /// The body starts at `start` rather than at byte 0.
    pub partial: bool,
    pub start: u64,
    /// Size of the complete resource when known.
    pub total: Option<u64>,
    pub identity: RemoteIdentity,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for TransferResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferResponse")
            .field("partial", &self.partial)
            .field("start", &self.start)
            .field("total", &self.total)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Something that can stream bytes for a URL.
#[async_trait]
pub trait TransferSource: Send + Sync {
    /// Whether this source can serve `url`.
    fn supports(&self, url: &Url) -> bool;

    /// Open a stream. A requested range may be ignored, which the response
    /// reports through `partial`.
    async fn open(&self, request: &TransferRequest) -> Result<TransferResponse>;
}

/// HTTP(S) source honouring `Range`/`If-Range`.
pub struct HttpTransferSource {
    client: Client,
}

impl HttpTransferSource {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: transfer_client()?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TransferSource for HttpTransferSource {
    fn supports(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    async fn open(&self, request: &TransferRequest) -> Result<TransferResponse> {
        let mut builder = self.client.get(request.url.clone());
        if let AuthMode::Bearer { token } = &request.auth {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if request.offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", request.offset));
            if let Some(validator) = if_range_value(request.validator.as_ref()) {
                builder = builder.header(IF_RANGE, validator);
            }
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        // Never echo the query token.
        let mut display_url = request.url.clone();
        display_url.set_query(None);

        let (partial, start, total) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let (start, total) = parse_content_range(&headers).ok_or_else(|| {
                    ShelfError::DownloadFailed {
                        url: display_url.to_string(),
                        message: "206 response without a usable Content-Range".to_string(),
                    }
                })?;
                (true, start, total)
            }
            s if s.is_success() => (false, 0, response.content_length()),
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(ShelfError::RateLimited {
                    service: display_url.host_str().unwrap_or("download").to_string(),
                })
            }
            s => {
                return Err(ShelfError::HttpStatus {
                    url: display_url.to_string(),
                    status: s.as_u16(),
                })
            }
        };

        debug!(
            "Opened {} (status {}, start {}, total {:?})",
            display_url, status, start, total
        );

        let identity = RemoteIdentity {
            etag: header_string(&headers, ETAG),
            last_modified: header_string(&headers, LAST_MODIFIED),
            length: total,
        };
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ShelfError::from))
            .boxed();

        Ok(TransferResponse {
            partial,
            start,
            total,
            identity,
            body,
        })
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Strong ETags are preferred; weak ones are not valid for `If-Range`.
fn if_range_value(identity: Option<&RemoteIdentity>) -> Option<String> {
    let identity = identity?;
    match &identity.etag {
        Some(etag) if !etag.starts_with("W/") => Some(etag.clone()),
        _ => identity.last_modified.clone(),
    }
}

/// `bytes <start>-<end>/<total|*>` to `(start, total)`.
fn parse_content_range(headers: &HeaderMap) -> Option<(u64, Option<u64>)> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let spec = value.trim().strip_prefix("bytes ")?;
    let (range, total) = spec.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        n => Some(n.parse().ok()?),
    };
    Some((start, total))
}
