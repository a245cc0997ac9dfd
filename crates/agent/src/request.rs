//! Query-facing request and result types

use serde::{Deserialize, Serialize};

use medirag_config::constants::rag;
use medirag_core::{Error, Result, ScoredCandidate};

use crate::stage::StageTrace;

/// A recommendation query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Generate a grounded explanation
    #[serde(default = "default_true")]
    pub include_narrative: bool,
    /// Retrieve related disease records alongside drugs
    #[serde(default = "default_true")]
    pub include_diseases: bool,
    /// Read and write session memory and the response cache
    #[serde(default = "default_true")]
    pub use_memory: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_top_k() -> usize {
    rag::DEFAULT_TOP_K
}

fn default_true() -> bool {
    true
}

impl RecommendationRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: default_top_k(),
            include_narrative: true,
            include_diseases: true,
            use_memory: true,
            session_id: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_narrative(mut self, enabled: bool) -> Self {
        self.include_narrative = enabled;
        self
    }

    pub fn with_diseases(mut self, enabled: bool) -> Self {
        self.include_diseases = enabled;
        self
    }

    pub fn with_memory(mut self, enabled: bool) -> Self {
        self.use_memory = enabled;
        self
    }

    /// Check bounds and return the trimmed query
    pub fn validate(&self, max_query_chars: usize, max_top_k: usize) -> Result<String> {
        let query = self.query.trim();
        if query.is_empty() {
            return Err(Error::Validation("Query must not be empty".to_string()));
        }
        let chars = query.chars().count();
        if chars > max_query_chars {
            return Err(Error::Validation(format!(
                "Query is {} characters, limit is {}",
                chars, max_query_chars
            )));
        }
        if self.top_k == 0 || self.top_k > max_top_k {
            return Err(Error::Validation(format!(
                "top_k must be between 1 and {}, got {}",
                max_top_k, self.top_k
            )));
        }
        Ok(query.to_string())
    }
}

/// Per-stage wall-clock timings in milliseconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub embedding_ms: u64,
    pub dense_ms: u64,
    pub sparse_ms: u64,
    /// Retrieval plus fusion
    pub fusion_ms: u64,
    pub rerank_ms: u64,
    pub synthesis_ms: u64,
    pub total_ms: u64,
    pub total_results: usize,
}

/// A stage that completed in degraded form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    pub stage: String,
    pub reason: String,
}

impl Degradation {
    pub fn new(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

/// Ranked candidates with optional narrative
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationResult {
    pub query: String,
    pub candidates: Vec<ScoredCandidate>,
    pub diseases: Vec<ScoredCandidate>,
    pub narrative: Option<String>,
    pub disclaimer: Option<String>,
    pub session_id: Option<String>,
    pub from_cache: bool,
    /// Session length after this turn was stored
    pub conversation_turn: Option<usize>,
    pub timings: StageTimings,
    pub degradations: Vec<Degradation>,
    pub trace: StageTrace,
}

impl RecommendationResult {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    pub fn candidate_ids(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.id()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_trims() {
        let request = RecommendationRequest::new("  두통  ");
        assert_eq!(request.validate(500, 20).unwrap(), "두통");
    }

    #[test]
    fn test_validate_rejects_blank() {
        let request = RecommendationRequest::new("   ");
        assert!(matches!(request.validate(500, 20), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_counts_chars_not_bytes() {
        let request = RecommendationRequest::new("두".repeat(10));
        assert!(request.validate(10, 20).is_ok());
        assert!(request.validate(9, 20).is_err());
    }

    #[test]
    fn test_validate_top_k_bounds() {
        let request = RecommendationRequest::new("두통");
        assert!(request.clone().with_top_k(0).validate(500, 20).is_err());
        assert!(request.clone().with_top_k(21).validate(500, 20).is_err());
        assert!(request.with_top_k(20).validate(500, 20).is_ok());
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: RecommendationRequest = serde_json::from_str(r#"{"query": "감기"}"#).unwrap();
        assert_eq!(request.top_k, 5);
        assert!(request.include_narrative);
        assert!(request.session_id.is_none());
    }
}
