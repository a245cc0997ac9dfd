//! Embedding providers
//!
//! - [`OpenAIEmbedder`] calls an OpenAI-compatible `/embeddings` endpoint
//! - [`HashEmbedder`] hashes lexical tokens into a fixed-width vector, for
//!   offline runs and tests

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use medirag_config::constants::{embedding, endpoints, timeouts};
use medirag_core::{EmbeddingProvider, Result};

use crate::tokenizer::Tokenizer;
use crate::RagError;

/// OpenAI embedding configuration
#[derive(Debug, Clone)]
pub struct OpenAIEmbeddingConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    /// Expected vector width; responses of another width are rejected
    pub dimension: usize,
    pub timeout: Duration,
}

impl Default for OpenAIEmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: endpoints::OPENAI_DEFAULT.to_string(),
            api_key: String::new(),
            model: embedding::MODEL.to_string(),
            dimension: embedding::DIMENSION,
            timeout: Duration::from_millis(timeouts::EMBEDDING_MS),
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// OpenAI-compatible embedder
pub struct OpenAIEmbedder {
    client: Client,
    config: OpenAIEmbeddingConfig,
}

impl OpenAIEmbedder {
    pub fn new(config: OpenAIEmbeddingConfig) -> std::result::Result<Self, RagError> {
        if config.api_key.is_empty() && !config.endpoint.contains("localhost") {
            return Err(RagError::Configuration(
                "Embedding API key is required for remote endpoints".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RagError::Configuration(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.config.endpoint.trim_end_matches('/'))
    }

    async fn request(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingRequest {
            model: &self.config.model,
            input: texts,
        };

        let mut request = self.client.post(self.embeddings_url()).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RagError::Embedding(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Embedding(format!(
                "Embedding request failed: {} - {}",
                status, text
            )));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::Embedding(format!("Failed to parse response: {}", e)))?;

        if parsed.data.len() != texts.len() {
            return Err(RagError::Embedding(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        parsed.data.sort_by_key(|d| d.index);

        let mut vectors = Vec::with_capacity(parsed.data.len());
        for data in parsed.data {
            if data.embedding.len() != self.config.dimension {
                return Err(RagError::DimensionMismatch {
                    expected: self.config.dimension,
                    actual: data.embedding.len(),
                });
            }
            vectors.push(data.embedding);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::Embedding("No embedding returned".to_string()).into())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(self.request(texts).await?)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

/// Deterministic feature-hashing embedder
///
/// Each lexical token is hashed into one of `dimension` buckets with a signed
/// weight and the result is L2-normalized. Texts sharing tokens get a positive
/// cosine, which is enough to exercise the dense channel without a model.
pub struct HashEmbedder {
    dimension: usize,
    tokenizer: Tokenizer,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            tokenizer: Tokenizer::default(),
        }
    }

    /// Synchronous embedding, used by both trait methods
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in self.tokenizer.tokenize(text) {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes.iter().fold(OFFSET, |hash, &b| (hash ^ b as u64).wrapping_mul(PRIME))
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::cosine_similarity;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: String, dimension: usize) -> OpenAIEmbeddingConfig {
        OpenAIEmbeddingConfig {
            endpoint,
            api_key: "test-key".to_string(),
            dimension,
            ..Default::default()
        }
    }

    #[test]
    fn test_remote_endpoint_requires_key() {
        let result = OpenAIEmbedder::new(OpenAIEmbeddingConfig::default());
        assert!(matches!(result, Err(RagError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_openai_batch_preserves_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"embedding": [0.0, 1.0, 0.0], "index": 1},
                    {"embedding": [1.0, 0.0, 0.0], "index": 0}
                ]
            })))
            .mount(&server)
            .await;

        let embedder = OpenAIEmbedder::new(config(server.uri(), 3)).unwrap();
        let vectors = embedder
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_openai_dimension_mismatch_is_configuration_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [1.0, 0.0], "index": 0}]
            })))
            .mount(&server)
            .await;

        let embedder = OpenAIEmbedder::new(config(server.uri(), 3)).unwrap();
        let err = embedder.embed("두통").await.unwrap_err();
        assert!(matches!(err, medirag_core::Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_openai_unauthorized_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let embedder = OpenAIEmbedder::new(config(server.uri(), 3)).unwrap();
        let err = embedder.embed("두통").await.unwrap_err();
        assert!(matches!(err, medirag_core::Error::Provider { .. }));
    }

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("두통 진통제").await.unwrap();
        let b = embedder.embed("두통 진통제").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_related_texts_are_closer() {
        let embedder = HashEmbedder::new(256);
        let query = embedder.embed_sync("두통");
        let related = embedder.embed_sync("두통 진통제");
        let unrelated = embedder.embed_sync("소화제 위장약");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn test_hash_embedder_empty_text_is_zero_vector() {
        let embedder = HashEmbedder::new(8);
        assert!(embedder.embed_sync("?!").iter().all(|v| *v == 0.0));
    }
}
