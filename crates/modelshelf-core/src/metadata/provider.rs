//! The provider seam and shared payload parsing.

use crate::error::Result;
use crate::types::ModelMetadata;
use async_trait::async_trait;
use serde_json::Value;

/// A source of model metadata keyed by content hash.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Short identifier recorded on resolved metadata (e.g. "civitai").
    fn name(&self) -> &str;

    /// Look up `sha256`. `Ok(None)` means the provider has no entry.
    async fn fetch(&self, sha256: &str) -> Result<Option<ModelMetadata>>;
}

/// Parse a CivitAI-style model-version object.
///
/// Shape: `{ id, modelId, name, baseModel, trainedWords, downloadUrl,
/// description, model: { name, description, tags } }`.
pub(crate) fn parse_version_payload(provider: &str, payload: &Value) -> Option<ModelMetadata> {
    let model = payload.get("model");
    let metadata = ModelMetadata {
        provider: provider.to_string(),
        model_id: payload
            .get("modelId")
            .and_then(Value::as_u64)
            .or_else(|| model.and_then(|m| m.get("id")).and_then(Value::as_u64)),
        version_id: payload.get("id").and_then(Value::as_u64),
        model_name: model.and_then(|m| str_field(m, "name")),
        version_name: str_field(payload, "name"),
        base_model: str_field(payload, "baseModel"),
        trained_words: string_list(payload.get("trainedWords")),
        description: model
            .and_then(|m| str_field(m, "description"))
            .or_else(|| str_field(payload, "description")),
        tags: string_list(model.and_then(|m| m.get("tags"))),
        download_url: str_field(payload, "downloadUrl"),
        raw: payload.clone(),
    };
    (!metadata.is_empty()).then_some(metadata)
}

pub(crate) fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Strings from a JSON array, accepting `["a"]` and `[{"name": "a"}]`.
pub(crate) fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => str_field(item, "name"),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_version_payload() {
        let payload = json!({
            "id": 12,
            "modelId": 3,
            "name": "v1.0",
            "baseModel": "SD 1.5",
            "trainedWords": ["detailed", ""],
            "downloadUrl": "https://example.com/dl/12",
            "model": {
                "name": "Detail Tweaker",
                "tags": ["concept", {"name": "detail"}]
            }
        });

        let meta = parse_version_payload("civitai", &payload).unwrap();
        assert_eq!(meta.version_id, Some(12));
        assert_eq!(meta.model_id, Some(3));
        assert_eq!(meta.model_name.as_deref(), Some("Detail Tweaker"));
        assert_eq!(meta.base_model.as_deref(), Some("SD 1.5"));
        assert_eq!(meta.trained_words, vec!["detailed"]);
        assert_eq!(meta.tags, vec!["concept", "detail"]);
        assert_eq!(meta.raw, payload);
    }

    #[test]
    fn test_empty_payload_is_none() {
        assert!(parse_version_payload("civitai", &json!({"files": []})).is_none());
    }
}
