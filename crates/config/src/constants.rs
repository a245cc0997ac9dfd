//! Centralized constants
//!
//! Single source of truth for default values used across the workspace.
//! Settings defaults and component `Default` impls read from here.

/// Retrieval and fusion
pub mod rag {
    /// Weight of the normalized dense score in fusion
    pub const DENSE_WEIGHT: f32 = 0.7;

    /// Weight of the normalized sparse score in fusion
    pub const SPARSE_WEIGHT: f32 = 0.3;

    /// Each channel fetches this many times the requested count
    pub const CANDIDATE_MULTIPLIER: usize = 3;

    pub const DEFAULT_TOP_K: usize = 5;
    pub const MAX_TOP_K: usize = 20;

    /// Disease records returned alongside drugs
    pub const DISEASE_TOP_K: usize = 2;

    pub const MAX_QUERY_CHARS: usize = 500;

    /// BM25 term frequency saturation
    pub const BM25_K1: f32 = 1.5;

    /// BM25 length normalization
    pub const BM25_B: f32 = 0.75;

    /// Character n-gram width for lexical tokens
    pub const NGRAM_WIDTH: usize = 2;
}

/// Second-pass reranking
pub mod reranker {
    pub const MODEL: &str = "rerank-multilingual-v3.0";

    /// Fused candidates sent to the reranker
    pub const TOP_N: usize = 20;

    /// Below this many candidates reranking is skipped
    pub const MIN_CANDIDATES: usize = 2;
}

/// Conversation memory and response cache
pub mod memory {
    pub const MAX_HISTORY: usize = 20;

    /// Prior turns included in the generation prompt
    pub const CONTEXT_WINDOW: usize = 3;

    /// Characters of a prior response kept in the prompt
    pub const RESPONSE_PREVIEW_CHARS: usize = 200;

    pub const HISTORY_TTL_SECS: u64 = 86_400;
    pub const CACHE_TTL_SECS: u64 = 3_600;

    /// Minimum gap between full expiry sweeps of the in-memory stores
    pub const SWEEP_INTERVAL_SECS: u64 = 60;
}

/// Generation
pub mod llm {
    pub const MODEL: &str = "gpt-4o-mini";
    pub const MAX_TOKENS: u32 = 2500;
    pub const TEMPERATURE: f32 = 0.3;
    pub const MAX_RETRIES: u32 = 2;
}

/// Embedding
pub mod embedding {
    pub const MODEL: &str = "text-embedding-3-small";
    pub const DIMENSION: usize = 1536;
    pub const BATCH_SIZE: usize = 64;
}

/// Per-call timeouts in milliseconds
pub mod timeouts {
    pub const EMBEDDING_MS: u64 = 10_000;
    pub const DENSE_MS: u64 = 3_000;
    pub const SPARSE_MS: u64 = 2_000;
    pub const RERANK_MS: u64 = 5_000;
    pub const LLM_MS: u64 = 60_000;
    pub const MEMORY_MS: u64 = 500;
}

/// Default service endpoints
pub mod endpoints {
    pub const OPENAI_DEFAULT: &str = "https://api.openai.com/v1";
    pub const OLLAMA_DEFAULT: &str = "http://localhost:11434";
    pub const QDRANT_DEFAULT: &str = "http://localhost:6334";
    pub const COHERE_DEFAULT: &str = "https://api.cohere.com";
}

/// Fixed user-facing text
pub mod messages {
    pub const DISCLAIMER: &str = "※ 이 정보는 참고용입니다. 실제 복약은 의사/약사와 상담하세요.";

    pub const NO_RESULTS: &str =
        "죄송합니다. 관련 정보를 찾을 수 없습니다. 다른 증상으로 검색해 보시거나, 약사/의사와 상담하세요.";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rag_weights_valid() {
        assert!(rag::DENSE_WEIGHT >= 0.0 && rag::DENSE_WEIGHT <= 1.0);
        assert!(rag::SPARSE_WEIGHT >= 0.0 && rag::SPARSE_WEIGHT <= 1.0);
    }

    #[test]
    fn test_top_k_bounds() {
        assert!(rag::DEFAULT_TOP_K <= rag::MAX_TOP_K);
        assert!(reranker::TOP_N >= rag::DEFAULT_TOP_K);
    }

    #[test]
    fn test_memory_window_fits_history() {
        assert!(memory::CONTEXT_WINDOW <= memory::MAX_HISTORY);
    }
}
