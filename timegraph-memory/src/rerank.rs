//! Cross-encoder reranking interface

use async_trait::async_trait;

use crate::error::ProviderError;

/// Rescores passages against a query
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &'static str {
        "reranker"
    }

    /// Score `passages` for `query`.
    ///
    /// Returns `(index into passages, relevance)` pairs, best first. Indices
    /// that are missing or out of range are ignored by the caller.
    async fn rerank(&self, query: &str, passages: &[String])
        -> Result<Vec<(usize, f64)>, ProviderError>;
}
