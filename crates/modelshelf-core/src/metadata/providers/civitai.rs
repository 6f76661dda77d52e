//! CivitAI REST lookups by file hash.

use crate::config::ProviderConfig;
use crate::error::{Result, ShelfError};
use crate::metadata::provider::{parse_version_payload, MetadataProvider};
use crate::network::{api_client, RateGate};
use crate::types::ModelMetadata;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

pub struct CivitaiProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    gate: RateGate,
}

impl CivitaiProvider {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Self::with_base_url(ProviderConfig::CIVITAI_API_BASE, api_key, timeout)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: api_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            gate: RateGate::per_second("civitai", ProviderConfig::REMOTE_REQUESTS_PER_SECOND),
        })
    }

    fn lookup_url(&self, sha256: &str) -> String {
        format!("{}/model-versions/by-hash/{}", self.base_url, sha256)
    }
}

#[async_trait]
impl MetadataProvider for CivitaiProvider {
    fn name(&self) -> &str {
        "civitai"
    }

    async fn fetch(&self, sha256: &str) -> Result<Option<ModelMetadata>> {
        self.gate.acquire().await;

        let url = self.lookup_url(sha256);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("CivitAI has no version for {}", sha256);
                Ok(None)
            }
            StatusCode::TOO_MANY_REQUESTS => Err(ShelfError::RateLimited {
                service: "civitai".into(),
            }),
            status if !status.is_success() => Err(ShelfError::HttpStatus {
                url,
                status: status.as_u16(),
            }),
            _ => {
                let payload: serde_json::Value = response.json().await?;
                Ok(parse_version_payload("civitai", &payload))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_url_trims_trailing_slash() {
        let provider =
            CivitaiProvider::with_base_url("https://civitai.test/api/v1/", None, Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            provider.lookup_url("abc"),
            "https://civitai.test/api/v1/model-versions/by-hash/abc"
        );
    }
}
