//! Local ONNX embeddings via fastembed (BGE-Small-EN-v1.5, 384 dimensions)

use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::Embedder;
use crate::error::ProviderError;

const PROVIDER: &str = "fastembed";

/// fastembed configuration
#[derive(Debug, Clone)]
pub struct FastEmbedConfig {
    /// Texts per ONNX batch (default: 64)
    pub batch_size: usize,
    /// Show model download progress on first use
    pub show_download_progress: bool,
}

impl Default for FastEmbedConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            show_download_progress: false,
        }
    }
}

/// Runs inference on the blocking pool so the async runtime is never stalled
pub struct FastEmbedder {
    model: Arc<TextEmbedding>,
    config: FastEmbedConfig,
    dimension: usize,
}

impl FastEmbedder {
    pub fn new(config: FastEmbedConfig) -> Result<Self, ProviderError> {
        log::info!("Loading fastembed model BGE-Small-EN-v1.5");
        let options = InitOptions::new(EmbeddingModel::BGESmallENV15)
            .with_show_download_progress(config.show_download_progress);
        let model = TextEmbedding::try_new(options)
            .map_err(|e| ProviderError::terminal(PROVIDER, format!("model load failed: {e}")))?;

        Ok(Self {
            model: Arc::new(model),
            config,
            dimension: 384,
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| ProviderError::terminal(PROVIDER, "empty embedding batch"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = Arc::clone(&self.model);
        let batch = texts.to_vec();
        let batch_size = self.config.batch_size;

        tokio::task::spawn_blocking(move || model.embed(batch, Some(batch_size)))
            .await
            .map_err(|e| ProviderError::unavailable(PROVIDER, format!("worker panicked: {e}")))?
            .map_err(|e| ProviderError::terminal(PROVIDER, e.to_string()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
