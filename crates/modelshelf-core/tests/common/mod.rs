//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use modelshelf_core::download::{RemoteIdentity, TransferRequest, TransferResponse, TransferSource};
use modelshelf_core::{MetadataProvider, ModelMetadata, Result, ShelfError};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

/// In-memory `mem://` source. With a gate, each chunk waits for one permit.
pub struct MemorySource {
    body: Bytes,
    ranges: bool,
    chunk_size: usize,
    gate: Option<Arc<Semaphore>>,
    served: Mutex<Vec<u64>>,
}

impl MemorySource {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Bytes::from(body.into()),
            ranges: true,
            chunk_size: 8,
            gate: None,
            served: Mutex::new(Vec::new()),
        }
    }

    /// Ignore `Range` and always serve the whole body.
    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// First byte of every body served so far.
    pub fn served_offsets(&self) -> Vec<u64> {
        self.served.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferSource for MemorySource {
    fn supports(&self, url: &Url) -> bool {
        url.scheme() == "mem"
    }

    async fn open(&self, request: &TransferRequest) -> Result<TransferResponse> {
        let start = if self.ranges {
            (request.offset as usize).min(self.body.len())
        } else {
            0
        };
        self.served.lock().unwrap().push(start as u64);

        let chunk = self.chunk_size;
        let rest = self.body.slice(start..);
        let stream = futures::stream::unfold((rest, self.gate.clone()), move |(mut rest, gate)| async move {
            if rest.is_empty() {
                return None;
            }
            if let Some(gate) = &gate {
                gate.acquire().await.ok()?.forget();
            }
            let piece = rest.split_to(chunk.min(rest.len()));
            Some((Ok::<Bytes, ShelfError>(piece), (rest, gate)))
        });

        let total = self.body.len() as u64;
        Ok(TransferResponse {
            partial: self.ranges && start > 0,
            start: start as u64,
            total: Some(total),
            identity: RemoteIdentity {
                etag: Some("\"v1\"".into()),
                last_modified: None,
                length: Some(total),
            },
            body: stream.boxed(),
        })
    }
}

/// Provider returning the same answer for every hash.
pub struct FixedProvider {
    pub metadata: Option<ModelMetadata>,
    pub delay: Duration,
}

impl FixedProvider {
    pub fn named(model_name: &str, base_model: &str) -> Self {
        Self {
            metadata: Some(ModelMetadata {
                provider: "fixed".into(),
                model_name: Some(model_name.into()),
                base_model: Some(base_model.into()),
                ..Default::default()
            }),
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl MetadataProvider for FixedProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn fetch(&self, _sha256: &str) -> Result<Option<ModelMetadata>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.metadata.clone())
    }
}

/// Poll `check` until it holds, failing after a few seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn write_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}
