//! Embedding providers
//!
//! One [`Embedder`] implementation per vendor; [`CachedEmbedder`] wraps any
//! of them with a bounded content cache.

mod cache;
#[cfg(feature = "fastembed")]
mod fastembed;

use async_trait::async_trait;

use crate::error::ProviderError;

pub use cache::CachedEmbedder;
#[cfg(feature = "fastembed")]
pub use self::fastembed::{FastEmbedConfig, FastEmbedder};

/// Text to fixed-length vector
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Embed several texts, preserving order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Vector length produced by this embedder
    fn dimension(&self) -> usize;
}
