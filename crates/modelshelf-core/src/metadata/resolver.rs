//! Ordered fallback chain over metadata providers.

use crate::config::{ProviderConfig, ProviderId, ShelfConfig};
use crate::error::Result;
use crate::metadata::provider::MetadataProvider;
use crate::metadata::providers::{ArchiveDbProvider, CivArchiveProvider, CivitaiProvider};
use crate::network::{CircuitBreaker, CircuitBreakerConfig};
use crate::types::ModelMetadata;
use mini_moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a lookup. Exhausting the chain is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved {
        metadata: ModelMetadata,
        provider: String,
    },
    Unavailable,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved { .. })
    }
}

struct ProviderSlot {
    provider: Arc<dyn MetadataProvider>,
    breaker: CircuitBreaker,
}

pub struct MetadataResolver {
    providers: Vec<ProviderSlot>,
    call_timeout: Duration,
    breaker_config: CircuitBreakerConfig,
    /// Hashes every provider cleanly answered "unknown" for.
    negative: Cache<String, ()>,
}

impl MetadataResolver {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            call_timeout,
            breaker_config: CircuitBreakerConfig::default(),
            negative: Cache::builder()
                .max_capacity(ProviderConfig::NEGATIVE_CACHE_CAPACITY)
                .time_to_live(ProviderConfig::NEGATIVE_CACHE_TTL)
                .build(),
        }
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Append a provider; earlier providers take priority.
    pub fn with_provider(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        let breaker = CircuitBreaker::with_config(provider.name(), self.breaker_config.clone());
        self.providers.push(ProviderSlot { provider, breaker });
        self
    }

    /// Build the chain described by `config.provider_order`.
    ///
    /// The archive provider is skipped when no archive database is configured.
    pub fn from_config(config: &ShelfConfig) -> Result<Self> {
        let mut resolver = Self::new(config.provider_timeout);
        for id in &config.provider_order {
            let provider: Arc<dyn MetadataProvider> = match id {
                ProviderId::Archive => match &config.archive_db_path {
                    Some(path) => match ArchiveDbProvider::open(path) {
                        Ok(provider) => Arc::new(provider),
                        Err(e) => {
                            warn!("Archive database unavailable at {}: {}", path.display(), e);
                            continue;
                        }
                    },
                    None => {
                        debug!("No archive database configured; skipping");
                        continue;
                    }
                },
                ProviderId::Civitai => Arc::new(CivitaiProvider::new(
                    config.civitai_api_key.clone(),
                    config.provider_timeout,
                )?),
                ProviderId::CivArchive => Arc::new(CivArchiveProvider::new(config.provider_timeout)?),
            };
            resolver = resolver.with_provider(provider);
        }
        info!("Metadata providers: {:?}", resolver.provider_names());
        Ok(resolver)
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|slot| slot.provider.name().to_string())
            .collect()
    }

    /// Try each provider in order; the first non-empty answer wins.
    pub async fn resolve(&self, sha256: &str) -> Resolution {
        let key = sha256.to_lowercase();
        if self.negative.contains_key(&key) {
            debug!("Negative cache hit for {}", key);
            return Resolution::Unavailable;
        }

        let mut clean_miss = true;
        for slot in &self.providers {
            let name = slot.provider.name();
            if !slot.breaker.allow_request() {
                debug!("Skipping {}: circuit open", name);
                clean_miss = false;
                continue;
            }

            match tokio::time::timeout(self.call_timeout, slot.provider.fetch(&key)).await {
                Ok(Ok(Some(metadata))) if !metadata.is_empty() => {
                    slot.breaker.record_success();
                    debug!("{} resolved {}", name, key);
                    return Resolution::Resolved {
                        metadata,
                        provider: name.to_string(),
                    };
                }
                Ok(Ok(_)) => {
                    slot.breaker.record_success();
                }
                Ok(Err(e)) => {
                    warn!("Provider {} failed for {}: {}", name, key, e);
                    slot.breaker.record_failure();
                    clean_miss = false;
                }
                Err(_) => {
                    warn!("Provider {} timed out after {:?}", name, self.call_timeout);
                    slot.breaker.record_failure();
                    clean_miss = false;
                }
            }
        }

        if clean_miss {
            self.negative.insert(key, ());
        }
        Resolution::Unavailable
    }

    /// Drop a negative-cache entry so the next lookup hits providers again.
    pub fn forget(&self, sha256: &str) {
        self.negative.invalidate(&sha256.to_lowercase());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ShelfError;
    use crate::metadata::providers::build_archive;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Provider answering from a fixed script.
    pub(crate) struct ScriptedProvider {
        pub name: &'static str,
        pub answer: fn(&str) -> Result<Option<ModelMetadata>>,
        pub delay: Option<Duration>,
        pub calls: AtomicUsize,
    }

    impl ScriptedProvider {
        pub fn new(name: &'static str, answer: fn(&str) -> Result<Option<ModelMetadata>>) -> Self {
            Self {
                name,
                answer,
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MetadataProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch(&self, sha256: &str) -> Result<Option<ModelMetadata>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.answer)(sha256)
        }
    }

    fn found(_: &str) -> Result<Option<ModelMetadata>> {
        Ok(Some(ModelMetadata {
            provider: "b".into(),
            model_name: Some("From B".into()),
            ..Default::default()
        }))
    }

    fn broken(_: &str) -> Result<Option<ModelMetadata>> {
        Err(ShelfError::Network {
            message: "connection refused".into(),
            cause: None,
        })
    }

    fn missing(_: &str) -> Result<Option<ModelMetadata>> {
        Ok(None)
    }

    #[tokio::test]
    async fn test_error_falls_through_to_next_provider() {
        let resolver = MetadataResolver::new(Duration::from_secs(1))
            .with_provider(Arc::new(ScriptedProvider::new("a", broken)))
            .with_provider(Arc::new(ScriptedProvider::new("b", found)));

        match resolver.resolve("abc").await {
            Resolution::Resolved { metadata, provider } => {
                assert_eq!(provider, "b");
                assert_eq!(metadata.model_name.as_deref(), Some("From B"));
            }
            Resolution::Unavailable => panic!("expected provider b to resolve"),
        }
    }

    #[tokio::test]
    async fn test_timeout_falls_through() {
        let mut slow = ScriptedProvider::new("slow", found);
        slow.delay = Some(Duration::from_secs(5));
        let resolver = MetadataResolver::new(Duration::from_millis(20))
            .with_provider(Arc::new(slow))
            .with_provider(Arc::new(ScriptedProvider::new("b", found)));

        let resolution = resolver.resolve("abc").await;
        assert!(matches!(resolution, Resolution::Resolved { provider, .. } if provider == "b"));
    }

    #[tokio::test]
    async fn test_exhaustion_is_unavailable_and_cached() {
        let provider = Arc::new(ScriptedProvider::new("a", missing));
        let resolver = MetadataResolver::new(Duration::from_secs(1)).with_provider(provider.clone());

        assert_eq!(resolver.resolve("abc").await, Resolution::Unavailable);
        assert_eq!(resolver.resolve("ABC").await, Resolution::Unavailable);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        resolver.forget("abc");
        resolver.resolve("abc").await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_negatively_cached() {
        let provider = Arc::new(ScriptedProvider::new("a", broken));
        let resolver = MetadataResolver::new(Duration::from_secs(1)).with_provider(provider.clone());

        resolver.resolve("abc").await;
        resolver.resolve("abc").await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_provider() {
        let provider = Arc::new(ScriptedProvider::new("a", broken));
        let resolver = MetadataResolver::new(Duration::from_secs(1))
            .with_breaker_config(CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            })
            .with_provider(provider.clone());

        resolver.resolve("one").await;
        resolver.resolve("two").await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_from_config_uses_archive() {
        let dir = TempDir::new().unwrap();
        let archive = build_archive(dir.path(), "deadbeef");
        let config = ShelfConfig::new(dir.path())
            .with_archive_db(&archive)
            .with_provider_order(vec![ProviderId::Archive]);

        let resolver = MetadataResolver::from_config(&config).unwrap();
        assert_eq!(resolver.provider_names(), vec!["archive"]);
        let resolution = resolver.resolve("DEADBEEF").await;
        assert!(matches!(resolution, Resolution::Resolved { provider, .. } if provider == "archive"));
    }
}
