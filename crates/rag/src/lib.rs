//! Hybrid retrieval for drug recommendation
//!
//! Features:
//! - Lexical BM25 over word tokens and character bigrams
//! - Dense cosine retrieval (in-process scan or Qdrant)
//! - Tantivy lexical backend sharing the same token stream
//! - Weighted score fusion with per-channel degradation
//! - Optional reranking with pass-through on failure
//! - Immutable corpus snapshots swapped atomically on rebuild

pub mod embeddings;
pub mod fusion;
pub mod knowledge_loader;
pub mod ollama_embeddings;
pub mod reranker;
pub mod snapshot;
pub mod sparse_search;
pub mod tantivy_index;
pub mod tokenizer;
pub mod vector_store;

pub use embeddings::{HashEmbedder, OpenAIEmbedder, OpenAIEmbeddingConfig};
pub use fusion::{ChannelReport, ChannelStatus, FusionConfig, FusionOutcome, HybridFusionEngine};
pub use knowledge_loader::KnowledgeLoader;
pub use ollama_embeddings::{OllamaEmbedder, OllamaEmbeddingConfig};
pub use reranker::{
    rerank_text, CohereReranker, CohereRerankerConfig, LexicalOverlapReranker, RerankConfig,
    RerankOutcome, RerankStage, RerankStatus,
};
pub use snapshot::{CorpusSnapshot, IndexBackend, IndexBuilder, KnowledgeBase};
pub use sparse_search::{Bm25Index, Bm25Params, LexicalIndex, SparseHit};
pub use tantivy_index::TantivyLexicalIndex;
pub use tokenizer::{QueryExpander, Tokenizer};
pub use vector_store::{
    cosine_similarity, DenseHit, DenseIndex, InMemoryDenseIndex, QdrantDenseIndex,
    VectorStoreConfig,
};

use thiserror::Error;

/// RAG errors
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Reranker error: {0}")]
    Reranker(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Load error: {0}")]
    Load(String),
}

impl From<RagError> for medirag_core::Error {
    fn from(err: RagError) -> Self {
        use medirag_core::Error;

        match err {
            RagError::DimensionMismatch { .. } | RagError::Configuration(_) => {
                Error::Configuration(err.to_string())
            },
            RagError::Embedding(msg) => Error::provider("embedding", msg),
            RagError::Reranker(msg) => Error::provider("reranker", msg),
            RagError::Connection(msg) => Error::provider("connection", msg),
            RagError::VectorStore(_)
            | RagError::Search(_)
            | RagError::Index(_)
            | RagError::Load(_) => Error::Index(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: medirag_core::Error = RagError::DimensionMismatch {
            expected: 1536,
            actual: 768,
        }
        .into();
        assert!(matches!(err, medirag_core::Error::Configuration(_)));

        let err: medirag_core::Error = RagError::Embedding("401".into()).into();
        assert!(err.is_recoverable());
    }
}
