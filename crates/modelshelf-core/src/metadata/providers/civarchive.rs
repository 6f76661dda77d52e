//! CivArchive lookups, used when CivitAI has dropped a model.

use crate::config::ProviderConfig;
use crate::error::{Result, ShelfError};
use crate::metadata::provider::{parse_version_payload, str_field, string_list, MetadataProvider};
use crate::network::{api_client, RateGate};
use crate::types::ModelMetadata;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

pub struct CivArchiveProvider {
    client: Client,
    base_url: String,
    gate: RateGate,
}

impl CivArchiveProvider {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(ProviderConfig::CIVARCHIVE_API_BASE, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: api_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            gate: RateGate::per_second("civarchive", ProviderConfig::REMOTE_REQUESTS_PER_SECOND),
        })
    }
}

/// Accepts `{ data: { model, version } }`, `{ model, version }` or a bare
/// CivitAI-style version object.
fn parse_archive_payload(payload: &Value) -> Option<ModelMetadata> {
    let body = payload.get("data").unwrap_or(payload);
    let Some(version) = body.get("version") else {
        return parse_version_payload("civarchive", body);
    };

    let mut merged = version.clone();
    if let (Some(model), Value::Object(map)) = (body.get("model"), &mut merged) {
        map.entry("model").or_insert_with(|| model.clone());
    }
    let mut metadata = parse_version_payload("civarchive", &merged)?;
    if metadata.tags.is_empty() {
        metadata.tags = string_list(body.get("model").and_then(|m| m.get("tags")));
    }
    if metadata.model_name.is_none() {
        metadata.model_name = body.get("model").and_then(|m| str_field(m, "name"));
    }
    metadata.raw = payload.clone();
    Some(metadata)
}

#[async_trait]
impl MetadataProvider for CivArchiveProvider {
    fn name(&self) -> &str {
        "civarchive"
    }

    async fn fetch(&self, sha256: &str) -> Result<Option<ModelMetadata>> {
        self.gate.acquire().await;

        let url = format!("{}/sha256/{}", self.base_url, sha256.to_lowercase());
        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::TOO_MANY_REQUESTS => Err(ShelfError::RateLimited {
                service: "civarchive".into(),
            }),
            status if !status.is_success() => Err(ShelfError::HttpStatus {
                url,
                status: status.as_u16(),
            }),
            _ => {
                let payload: Value = response.json().await?;
                Ok(parse_archive_payload(&payload))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wrapped_payload() {
        let payload = json!({
            "data": {
                "model": {"id": 5, "name": "Lost Model", "tags": ["anime"]},
                "version": {"id": 50, "name": "final", "baseModel": "Pony"}
            }
        });
        let meta = parse_archive_payload(&payload).unwrap();
        assert_eq!(meta.provider, "civarchive");
        assert_eq!(meta.model_name.as_deref(), Some("Lost Model"));
        assert_eq!(meta.model_id, Some(5));
        assert_eq!(meta.version_id, Some(50));
        assert_eq!(meta.base_model.as_deref(), Some("Pony"));
        assert_eq!(meta.tags, vec!["anime"]);
    }

    #[test]
    fn test_parse_flat_payload() {
        let payload = json!({"id": 9, "modelId": 2, "model": {"name": "Flat"}});
        let meta = parse_archive_payload(&payload).unwrap();
        assert_eq!(meta.model_name.as_deref(), Some("Flat"));
    }

    #[test]
    fn test_parse_empty_payload() {
        assert!(parse_archive_payload(&json!({"data": {}})).is_none());
    }
}
