//! Content-addressed cache of OCR results.
//!
//! Keys are `ocr:` + hex SHA-256 of the image bytes, so identical pages hit
//! regardless of filename. Lookups that fail or hold undecodable values are
//! treated as misses; write failures are logged and swallowed.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::metrics::Metrics;
use crate::models::OcrResult;
use crate::ocr::{OcrEngine, OcrError};

const CACHE_OP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct OcrCache {
    cache: Arc<dyn Cache>,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl OcrCache {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            cache,
            ttl,
            metrics,
        }
    }

    pub fn key_for(bytes: &[u8]) -> String {
        format!("ocr:{}", hex::encode(Sha256::digest(bytes)))
    }

    pub async fn lookup(&self, key: &str) -> Option<OcrResult> {
        let raw = match tokio::time::timeout(CACHE_OP_TIMEOUT, self.cache.get(key)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                tracing::warn!(key, error = %e, "OCR cache lookup failed");
                return None;
            }
            Err(_) => {
                tracing::warn!(key, "OCR cache lookup timed out");
                return None;
            }
        };
        match serde_json::from_str::<OcrResult>(&raw) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding undecodable OCR cache entry");
                None
            }
        }
    }

    /// Best-effort; never fails the caller.
    pub async fn store(&self, key: &str, result: &OcrResult, ttl: Duration) {
        let value = match serde_json::to_string(result) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, error = %e, "cannot encode OCR result for cache");
                return;
            }
        };
        match tokio::time::timeout(CACHE_OP_TIMEOUT, self.cache.set_with_ttl(key, &value, ttl))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(key, error = %e, "OCR cache write failed"),
            Err(_) => tracing::warn!(key, "OCR cache write timed out"),
        }
    }

    /// Cache hit returns without touching the engine; a miss runs the
    /// engine and writes the result back.
    pub async fn extract_cached(
        &self,
        cancel: &CancellationToken,
        engine: &OcrEngine,
        bytes: &[u8],
        mime: &str,
    ) -> Result<OcrResult, OcrError> {
        let key = Self::key_for(bytes);

        let cached = tokio::select! {
            _ = cancel.cancelled() => return Err(OcrError::Canceled),
            hit = self.lookup(&key) => hit,
        };
        if let Some(hit) = cached {
            self.metrics.incr("ocr_cache_hits_total", &[]);
            tracing::debug!(key = %key, "OCR cache hit");
            return Ok(hit);
        }
        self.metrics.incr("ocr_cache_misses_total", &[]);

        let result = engine.extract_bytes(cancel, bytes, mime).await?;
        self.store(&key, &result, self.ttl).await;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use async_trait::async_trait;

    struct Broken;

    #[async_trait]
    impl Cache for Broken {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("connection refused")
        }
        async fn set_with_ttl(&self, _k: &str, _v: &str, _ttl: Duration) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn delete(&self, _key: &str) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        fn backend(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn key_is_prefixed_sha256_hex() {
        let key = OcrCache::key_for(b"abc");
        assert_eq!(
            key,
            "ocr:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn store_then_lookup() {
        let cache = OcrCache::new(
            Arc::new(MemoryCache::new(16)),
            Duration::from_secs(60),
            Arc::new(Metrics::new()),
        );
        let result = OcrResult {
            text: "page".into(),
            confidence: 0.8,
        };
        cache.store("ocr:k", &result, Duration::from_secs(60)).await;
        assert_eq!(cache.lookup("ocr:k").await, Some(result));
    }

    #[tokio::test]
    async fn garbage_entry_is_a_miss() {
        let backing = Arc::new(MemoryCache::new(16));
        backing
            .set_with_ttl("ocr:k", "not json", Duration::from_secs(60))
            .await
            .unwrap();
        let cache = OcrCache::new(backing, Duration::from_secs(60), Arc::new(Metrics::new()));
        assert_eq!(cache.lookup("ocr:k").await, None);
    }

    #[tokio::test]
    async fn broken_backend_is_a_silent_miss() {
        let cache = OcrCache::new(
            Arc::new(Broken),
            Duration::from_secs(60),
            Arc::new(Metrics::new()),
        );
        assert_eq!(cache.lookup("ocr:k").await, None);
        cache
            .store(
                "ocr:k",
                &OcrResult {
                    text: "x".into(),
                    confidence: 1.0,
                },
                Duration::from_secs(60),
            )
            .await;
    }
}
