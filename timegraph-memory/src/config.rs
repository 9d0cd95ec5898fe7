//! Engine configuration
//!
//! Every section has defaults, so `{}` is a valid configuration document.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Top-level configuration for [`crate::TemporalGraph`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Prior episodes handed to the extractor as context
    pub episode_window: usize,
    pub dedup: DedupConfig,
    pub invalidation: InvalidationConfig,
    pub search: SearchConfig,
    pub provider: ProviderPolicy,
    /// Entries kept by the embedding LRU cache
    pub embedding_cache_capacity: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            episode_window: 3,
            dedup: DedupConfig::default(),
            invalidation: InvalidationConfig::default(),
            search: SearchConfig::default(),
            provider: ProviderPolicy::default(),
            embedding_cache_capacity: 4096,
        }
    }
}

impl GraphConfig {
    /// Parse from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject values that would make the engine misbehave
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.dedup.similarity_threshold) {
            return Err(GraphError::validation(format!(
                "dedup.similarity_threshold must be within [0, 1], got {}",
                self.dedup.similarity_threshold
            )));
        }
        if self.search.rrf_k <= 0.0 {
            return Err(GraphError::validation("search.rrf_k must be positive"));
        }
        if self.provider.timeout_ms == 0 {
            return Err(GraphError::validation("provider.timeout_ms must be positive"));
        }
        if self.embedding_cache_capacity == 0 {
            return Err(GraphError::validation(
                "embedding_cache_capacity must be positive",
            ));
        }
        Ok(())
    }
}

/// Entity resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Nearest existing entities considered per mention
    pub top_k: usize,
    /// Minimum cosine similarity for a candidate to be considered the same
    pub similarity_threshold: f32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            similarity_threshold: 0.85,
        }
    }
}

/// Contradiction search settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Existing edges checked for contradiction per new fact
    pub max_candidates: usize,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self { max_candidates: 20 }
    }
}

/// Hybrid search settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Maximum results per result kind
    pub limit: usize,
    /// Floor for the per-channel candidate count (`max(limit * 3, channel_limit)`)
    pub channel_limit: usize,
    /// Reciprocal-rank fusion constant `c` in `1 / (rank + c)`
    pub rrf_k: f64,
    /// Hop limit for graph proximity
    pub bfs_max_depth: usize,
    /// Fused candidates handed to the reranker
    pub rerank_window: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            channel_limit: 20,
            rrf_k: 1.0,
            bfs_max_depth: 2,
            rerank_window: 20,
        }
    }
}

impl SearchConfig {
    pub fn channel_size(&self, limit: usize) -> usize {
        limit.saturating_mul(3).max(self.channel_limit)
    }
}

/// Timeout and retry policy applied to every provider call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderPolicy {
    pub timeout_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ProviderPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl ProviderPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}
