//! Embedding provider trait

use async_trait::async_trait;

use crate::Result;

/// Converts text into a fixed-length dense vector
///
/// Implementations:
/// - `OpenAIEmbedder` - OpenAI-compatible `/embeddings` endpoint
/// - `OllamaEmbedder` - Local Ollama `/api/embed`
/// - `HashEmbedder` - Deterministic offline embedder
#[async_trait]
pub trait EmbeddingProvider: Send + Sync + 'static {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts, preserving order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Output dimension
    fn dimension(&self) -> usize;

    /// Provider name for logging
    fn name(&self) -> &str;
}
