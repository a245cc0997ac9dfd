//! Per-query scored candidates

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::document::Document;

/// Which retrieval channels found a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchChannel {
    Dense,
    Sparse,
    Both,
}

/// Candidate produced for a single query
///
/// Channel scores are the normalized values that entered fusion; a channel
/// that did not return the document leaves its score as `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub document: Arc<Document>,
    pub dense_score: Option<f32>,
    pub sparse_score: Option<f32>,
    pub fused_score: f32,
    pub rerank_score: Option<f32>,
    pub channel: MatchChannel,
}

impl ScoredCandidate {
    pub fn id(&self) -> &str {
        &self.document.id
    }

    /// Best available relevance: rerank score if present, else fused
    pub fn relevance(&self) -> f32 {
        self.rerank_score.unwrap_or(self.fused_score)
    }
}

fn by_score_then_id(a_score: f32, a_id: &str, b_score: f32, b_id: &str) -> Ordering {
    b_score.total_cmp(&a_score).then_with(|| a_id.cmp(b_id))
}

/// Sort descending by fused score, ties broken by document id
pub fn sort_by_fused(candidates: &mut [ScoredCandidate]) {
    candidates.sort_by(|a, b| by_score_then_id(a.fused_score, a.id(), b.fused_score, b.id()));
}

/// Sort descending by rerank score, ties broken by document id
///
/// Candidates without a rerank score sort after those with one.
pub fn sort_by_rerank(candidates: &mut [ScoredCandidate]) {
    candidates.sort_by(|a, b| match (a.rerank_score, b.rerank_score) {
        (Some(x), Some(y)) => by_score_then_id(x, a.id(), y, b.id()),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
