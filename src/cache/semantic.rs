//! Deduplicating cache: near-duplicate payloads are stored once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::codec;
use crate::cache::pattern::glob_to_regex;
use crate::cache::similarity::{Embedder, SimilarityIndex};
use crate::cache::store::{CacheStats, RemovalCause, RemovalListener};
use crate::cache::tiered::TieredCache;
use crate::cache::traits::{Cache, EnhancedCache};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::remote::adapter::RemoteStore;

/// Result of [`SemanticCache::set_with_deduplication`].
#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    /// The value was stored and indexed.
    Stored,
    /// A similar entry already exists; nothing was stored.
    Duplicate { existing_key: String, similarity: f32 },
}

/// One [`SemanticCache::find_similar`] result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarMatch<T> {
    pub key: String,
    pub similarity: f32,
    pub value: T,
}

pub struct SemanticCache {
    inner: Arc<TieredCache>,
    index: Arc<SimilarityIndex>,
    embedder: Arc<dyn Embedder>,
    threshold: f32,
    /// Serialises deduplicating writes so that check, store and index form one step.
    write_gate: Mutex<()>,
    deduplicated: AtomicU64,
}

fn check_threshold(threshold: f32) -> Result<f32> {
    if threshold > 0.0 && threshold <= 1.0 {
        Ok(threshold)
    } else {
        Err(CacheError::InvalidConfiguration(format!(
            "similarity threshold {threshold} outside (0, 1]"
        )))
    }
}

impl SemanticCache {
    pub fn from_config(
        config: &CacheConfig,
        remote: Option<Arc<dyn RemoteStore>>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let index = Arc::new(SimilarityIndex::new());

        // An entry evicted from memory may still live in the remote tier; only
        // drop its record then if there is no remote tier.
        let has_remote = config.tiers.remote.is_some() && remote.is_some();
        let records = index.clone();
        let listener: RemovalListener = Arc::new(move |key: &str, cause: RemovalCause| {
            if cause == RemovalCause::Expired || !has_remote {
                records.remove(key);
            }
        });

        let inner = TieredCache::from_config(config, remote, Some(listener))?;
        Ok(Self {
            inner: Arc::new(inner),
            index,
            embedder,
            threshold: check_threshold(config.similarity_threshold)?,
            write_gate: Mutex::new(()),
            deduplicated: AtomicU64::new(0),
        })
    }

    pub fn inner(&self) -> &Arc<TieredCache> {
        &self.inner
    }

    pub fn index(&self) -> &SimilarityIndex {
        &self.index
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Writes suppressed as near-duplicates.
    pub fn deduplicated(&self) -> u64 {
        self.deduplicated.load(Ordering::Relaxed)
    }

    /// Store `value` unless an existing entry is at least `threshold` similar.
    ///
    /// A duplicate is not an error: the existing entry wins and the call
    /// reports which one. Records whose entries are gone are pruned on the way.
    pub async fn set_with_deduplication<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        threshold: Option<f32>,
    ) -> Result<DedupOutcome>
    where
        T: Serialize + Sync + ?Sized,
    {
        let threshold = check_threshold(threshold.unwrap_or(self.threshold))?;
        let bytes = codec::encode(value)?;
        let vector = self.embedder.embed(&bytes).await?;

        let _gate = self.write_gate.lock().await;
        loop {
            let Some(hit) = self.index.insert_unless_similar(key, vector.clone(), threshold)? else {
                break;
            };
            if self.inner.has(&hit.key).await? {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(
                    cache = %self.inner.name(),
                    key,
                    existing = %hit.key,
                    similarity = hit.similarity,
                    "Suppressed near-duplicate"
                );
                return Ok(DedupOutcome::Duplicate {
                    existing_key: hit.key,
                    similarity: hit.similarity,
                });
            }
            self.index.remove(&hit.key);
        }

        if let Err(err) = self.inner.set_bytes(key, bytes, ttl).await {
            self.index.remove(key);
            return Err(err);
        }
        Ok(DedupOutcome::Stored)
    }

    /// Entries at least `threshold` similar to `query`, most similar first.
    pub async fn find_similar<Q, T>(
        &self,
        query: &Q,
        threshold: Option<f32>,
    ) -> Result<Vec<SimilarMatch<T>>>
    where
        Q: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let threshold = check_threshold(threshold.unwrap_or(self.threshold))?;
        let payload = codec::encode(query)?;
        let vector = self.embedder.embed(&payload).await?;

        let mut matches = Vec::new();
        for hit in self.index.search(&vector, threshold)? {
            match self.inner.get_bytes(&hit.key).await? {
                Some(bytes) => matches.push(SimilarMatch {
                    key: hit.key,
                    similarity: hit.similarity,
                    value: codec::decode(&bytes)?,
                }),
                None => {
                    self.index.remove(&hit.key);
                }
            }
        }
        Ok(matches)
    }
}

#[async_trait]
impl Cache for SemanticCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.get_bytes(key).await
    }

    /// Plain write: always stores, and indexes the payload.
    async fn set_bytes(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let vector = self.embedder.embed(&value).await?;
        self.inner.set_bytes(key, value, ttl).await?;
        self.index.insert(key, vector)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.inner.delete(key).await?;
        self.index.remove(key);
        Ok(removed)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        self.inner.has(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await?;
        self.index.clear();
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

#[async_trait]
impl EnhancedCache for SemanticCache {
    async fn get_many_bytes(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.inner.get_many_bytes(keys).await
    }

    async fn set_many_bytes(
        &self,
        entries: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        for (key, value) in entries {
            self.set_bytes(&key, value, ttl).await?;
        }
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        let matcher = glob_to_regex(pattern)?;
        let removed = self.inner.delete_pattern(pattern).await?;
        self.index.retain(|key| !matcher.is_match(key));
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::similarity::HashingEmbedder;
    use crate::cache::traits::CacheExt;

    fn cache(max_size: usize) -> SemanticCache {
        let mut config = CacheConfig::named("answers");
        config.max_size = max_size;
        SemanticCache::from_config(&config, None, Arc::new(HashingEmbedder::new(128))).unwrap()
    }

    #[tokio::test]
    async fn test_identical_payload_is_duplicate() {
        let cache = cache(10);
        let first = cache
            .set_with_deduplication("q1", "what is the capital of france", None, None)
            .await
            .unwrap();
        assert_eq!(first, DedupOutcome::Stored);

        let second = cache
            .set_with_deduplication("q2", "What is the capital of France?", None, None)
            .await
            .unwrap();
        assert!(matches!(second, DedupOutcome::Duplicate { ref existing_key, .. } if existing_key == "q1"));
        assert!(!cache.has("q2").await.unwrap());
        assert_eq!(cache.deduplicated(), 1);
    }

    #[tokio::test]
    async fn test_evicted_entry_no_longer_blocks() {
        let cache = cache(1);
        cache
            .set_with_deduplication("a", "alpha beta gamma", None, None)
            .await
            .unwrap();
        cache.set("b", "delta epsilon", None).await.unwrap();
        assert!(!cache.index().contains("a"));

        let outcome = cache
            .set_with_deduplication("c", "alpha beta gamma", None, None)
            .await
            .unwrap();
        assert_eq!(outcome, DedupOutcome::Stored);
    }

    #[tokio::test]
    async fn test_delete_pattern_drops_records() {
        let cache = cache(10);
        cache.set("doc:1", "one two", None).await.unwrap();
        cache.set("doc:2", "three four", None).await.unwrap();
        cache.set("note:1", "five six", None).await.unwrap();

        assert_eq!(cache.delete_pattern("doc:*").await.unwrap(), 2);
        assert_eq!(cache.index().len(), 1);
        assert!(cache.index().contains("note:1"));
    }

    #[tokio::test]
    async fn test_invalid_threshold() {
        let cache = cache(10);
        let err = cache
            .set_with_deduplication("k", "text", None, Some(1.5))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfiguration(_)));
    }
}
