//! Reranking provider trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Relevance score for one input document, addressed by its input index
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerankScore {
    pub index: usize,
    pub relevance_score: f32,
}

/// External second-pass relevance scorer
#[async_trait]
pub trait RerankProvider: Send + Sync + 'static {
    /// Score `documents` against `query`, returning at most `top_n` entries
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankScore>>;

    fn name(&self) -> &str;
}
