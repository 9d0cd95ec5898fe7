//! Content-keyed embedding cache

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use super::Embedder;
use crate::error::ProviderError;

/// Wraps an [`Embedder`] with an LRU cache keyed by the exact text.
///
/// Embedders are deterministic for a given text, so identical content (the
/// same entity name mentioned in many episodes, a re-ingested episode) is
/// embedded once.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Get cache size
    pub fn cache_size(&self) -> usize {
        self.cache.lock().len()
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if let Some(cached) = self.cache.lock().get(text) {
            return Ok(cached.clone());
        }

        let embedding = self.inner.embed(text).await?;
        self.cache.lock().put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut results: Vec<Option<Vec<f32>>> = {
            let mut cache = self.cache.lock();
            texts.iter().map(|text| cache.get(text).cloned()).collect()
        };

        let uncached: Vec<(usize, String)> = results
            .iter()
            .enumerate()
            .filter(|(_, cached)| cached.is_none())
            .map(|(i, _)| (i, texts[i].clone()))
            .collect();

        if !uncached.is_empty() {
            let uncached_texts: Vec<String> = uncached.iter().map(|(_, t)| t.clone()).collect();
            let fresh = self.inner.embed_batch(&uncached_texts).await?;
            if fresh.len() != uncached_texts.len() {
                return Err(ProviderError::terminal(
                    "embedder",
                    format!(
                        "batch returned {} vectors for {} texts",
                        fresh.len(),
                        uncached_texts.len()
                    ),
                ));
            }

            let mut cache = self.cache.lock();
            for ((idx, text), emb) in uncached.into_iter().zip(fresh) {
                cache.put(text, emb.clone());
                results[idx] = Some(emb);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}
