//! Hybrid fusion of dense and sparse retrieval
//!
//! Both channels run concurrently against one snapshot. Each returns raw
//! scores on its own scale, so scores are normalized per batch before being
//! combined with configurable weights:
//!
//! ```text
//! fused = dense_weight * dense_norm + sparse_weight * sparse_norm
//! ```
//!
//! A document found by only one channel counts 0 for the other. A channel
//! that fails or times out contributes nothing and the request carries on
//! with the remaining channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use medirag_config::constants::{rag, timeouts};
use medirag_config::RagConfig;
use medirag_core::{sort_by_fused, MatchChannel, ScoredCandidate};

use crate::snapshot::CorpusSnapshot;
use crate::sparse_search::SparseHit;
use crate::vector_store::DenseHit;
use crate::RagError;

/// Fusion configuration
#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub dense_weight: f32,
    pub sparse_weight: f32,
    /// Each channel fetches `candidate_multiplier * k`
    pub candidate_multiplier: usize,
    pub dense_timeout: Duration,
    pub sparse_timeout: Duration,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            dense_weight: rag::DENSE_WEIGHT,
            sparse_weight: rag::SPARSE_WEIGHT,
            candidate_multiplier: rag::CANDIDATE_MULTIPLIER,
            dense_timeout: Duration::from_millis(timeouts::DENSE_MS),
            sparse_timeout: Duration::from_millis(timeouts::SPARSE_MS),
        }
    }
}

impl From<&RagConfig> for FusionConfig {
    fn from(config: &RagConfig) -> Self {
        Self {
            dense_weight: config.dense_weight,
            sparse_weight: config.sparse_weight,
            candidate_multiplier: config.candidate_multiplier,
            dense_timeout: config.dense_timeout(),
            sparse_timeout: config.sparse_timeout(),
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), RagError> {
        for (name, weight) in [("dense", self.dense_weight), ("sparse", self.sparse_weight)] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(RagError::Configuration(format!(
                    "{} weight must be finite and non-negative, got {}",
                    name, weight
                )));
            }
        }
        if self.dense_weight == 0.0 && self.sparse_weight == 0.0 {
            return Err(RagError::Configuration(
                "Dense and sparse weights cannot both be zero".to_string(),
            ));
        }
        if self.candidate_multiplier == 0 {
            return Err(RagError::Configuration(
                "Candidate multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a retrieval channel ended
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStatus {
    Ok,
    Failed(String),
    TimedOut,
}

impl ChannelStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ChannelStatus::Ok)
    }
}

/// Per-channel outcome of one fusion call
#[derive(Debug, Clone)]
pub struct ChannelReport {
    pub status: ChannelStatus,
    pub hits: usize,
    pub elapsed_ms: u64,
}

impl ChannelReport {
    fn ok(hits: usize, elapsed: Duration) -> Self {
        Self {
            status: ChannelStatus::Ok,
            hits,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    fn degraded(status: ChannelStatus, elapsed: Duration) -> Self {
        Self {
            status,
            hits: 0,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Fused candidates plus channel diagnostics
#[derive(Debug, Clone)]
pub struct FusionOutcome {
    pub candidates: Vec<ScoredCandidate>,
    pub dense: ChannelReport,
    pub sparse: ChannelReport,
}

impl FusionOutcome {
    /// Names of channels that did not complete
    pub fn degraded_channels(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if !self.dense.status.is_ok() {
            out.push("dense");
        }
        if !self.sparse.status.is_ok() {
            out.push("sparse");
        }
        out
    }
}

/// Hybrid fusion engine
pub struct HybridFusionEngine {
    config: FusionConfig,
}

impl HybridFusionEngine {
    pub fn new(config: FusionConfig) -> Result<Self, RagError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Candidates fetched per channel for a final list of `k`
    pub fn fetch_size(&self, k: usize) -> usize {
        k.saturating_mul(self.config.candidate_multiplier).max(k)
    }

    /// Retrieve from both channels and fuse into at most `k` candidates
    ///
    /// Fails only on a query vector of the wrong dimension. Channel failures
    /// are reported in the outcome instead.
    pub async fn fuse(
        &self,
        snapshot: &Arc<CorpusSnapshot>,
        query: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<FusionOutcome, RagError> {
        let expected = snapshot.dense().dimension();
        if query_vector.len() != expected {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: query_vector.len(),
            });
        }

        let m = self.fetch_size(k);

        let (dense, sparse) = tokio::join!(
            self.dense_channel(snapshot, query_vector, m),
            self.sparse_channel(snapshot, query, m),
        );
        let (dense_hits, dense_report) = dense?;
        let (sparse_hits, sparse_report) = sparse;

        let candidates = fuse_hits(
            snapshot,
            &normalize_dense(&dense_hits),
            &normalize_sparse(&sparse_hits),
            self.config.dense_weight,
            self.config.sparse_weight,
            k,
        );

        tracing::debug!(
            kind = %snapshot.kind(),
            dense_hits = dense_report.hits,
            sparse_hits = sparse_report.hits,
            fused = candidates.len(),
            k,
            "Hybrid fusion complete"
        );

        Ok(FusionOutcome {
            candidates,
            dense: dense_report,
            sparse: sparse_report,
        })
    }

    async fn dense_channel(
        &self,
        snapshot: &Arc<CorpusSnapshot>,
        query_vector: &[f32],
        m: usize,
    ) -> Result<(Vec<DenseHit>, ChannelReport), RagError> {
        let start = Instant::now();
        let dense = snapshot.dense();

        match tokio::time::timeout(self.config.dense_timeout, dense.query(query_vector, m)).await {
            Ok(Ok(hits)) => {
                let report = ChannelReport::ok(hits.len(), start.elapsed());
                Ok((hits, report))
            },
            Ok(Err(err @ RagError::DimensionMismatch { .. })) => Err(err),
            Ok(Err(err)) => {
                tracing::warn!(backend = dense.name(), error = %err, "Dense retrieval failed");
                Ok((
                    Vec::new(),
                    ChannelReport::degraded(ChannelStatus::Failed(err.to_string()), start.elapsed()),
                ))
            },
            Err(_) => {
                tracing::warn!(
                    backend = dense.name(),
                    timeout_ms = self.config.dense_timeout.as_millis() as u64,
                    "Dense retrieval timed out"
                );
                Ok((
                    Vec::new(),
                    ChannelReport::degraded(ChannelStatus::TimedOut, start.elapsed()),
                ))
            },
        }
    }

    async fn sparse_channel(
        &self,
        snapshot: &Arc<CorpusSnapshot>,
        query: &str,
        m: usize,
    ) -> (Vec<SparseHit>, ChannelReport) {
        let start = Instant::now();
        let lexical = Arc::clone(snapshot.lexical());
        let name = lexical.name();
        let query = query.to_string();

        let task = tokio::task::spawn_blocking(move || lexical.search(&query, m));

        match tokio::time::timeout(self.config.sparse_timeout, task).await {
            Ok(Ok(Ok(hits))) => {
                let report = ChannelReport::ok(hits.len(), start.elapsed());
                (hits, report)
            },
            Ok(Ok(Err(err))) => {
                tracing::warn!(backend = name, error = %err, "Sparse retrieval failed");
                (
                    Vec::new(),
                    ChannelReport::degraded(ChannelStatus::Failed(err.to_string()), start.elapsed()),
                )
            },
            Ok(Err(join_err)) => {
                tracing::warn!(backend = name, error = %join_err, "Sparse retrieval task failed");
                (
                    Vec::new(),
                    ChannelReport::degraded(
                        ChannelStatus::Failed(join_err.to_string()),
                        start.elapsed(),
                    ),
                )
            },
            Err(_) => {
                tracing::warn!(
                    backend = name,
                    timeout_ms = self.config.sparse_timeout.as_millis() as u64,
                    "Sparse retrieval timed out"
                );
                (
                    Vec::new(),
                    ChannelReport::degraded(ChannelStatus::TimedOut, start.elapsed()),
                )
            },
        }
    }
}

/// Map raw cosines into [0, 1]
///
/// A batch with no negative score is clamped as is. If any score is
/// negative the whole batch is shifted with `(s + 1) / 2` so relative order
/// is preserved across the sign boundary.
fn normalize_dense(hits: &[DenseHit]) -> Vec<(String, f32)> {
    let any_negative = hits.iter().any(|h| h.score < 0.0);

    hits.iter()
        .map(|h| {
            let score = if any_negative {
                (h.score + 1.0) / 2.0
            } else {
                h.score
            };
            (h.id.clone(), sanitize(score))
        })
        .collect()
}

/// Divide by the batch maximum; all zero when the maximum is zero
fn normalize_sparse(hits: &[SparseHit]) -> Vec<(String, f32)> {
    let max = hits.iter().map(|h| h.score).fold(0.0f32, f32::max);

    hits.iter()
        .map(|h| {
            let score = if max > 0.0 { h.score / max } else { 0.0 };
            (h.id.clone(), sanitize(score))
        })
        .collect()
}

fn sanitize(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

fn fuse_hits(
    snapshot: &CorpusSnapshot,
    dense: &[(String, f32)],
    sparse: &[(String, f32)],
    dense_weight: f32,
    sparse_weight: f32,
    k: usize,
) -> Vec<ScoredCandidate> {
    let mut union: HashMap<&str, (Option<f32>, Option<f32>)> = HashMap::new();
    for (id, score) in dense {
        union.entry(id.as_str()).or_default().0 = Some(*score);
    }
    for (id, score) in sparse {
        union.entry(id.as_str()).or_default().1 = Some(*score);
    }

    let mut candidates: Vec<ScoredCandidate> = union
        .into_iter()
        .filter_map(|(id, (dense_score, sparse_score))| {
            let Some(document) = snapshot.document(id) else {
                tracing::debug!(id, "Hit for unknown document dropped");
                return None;
            };

            let channel = match (dense_score, sparse_score) {
                (Some(_), Some(_)) => MatchChannel::Both,
                (Some(_), None) => MatchChannel::Dense,
                _ => MatchChannel::Sparse,
            };
            let fused = dense_weight * dense_score.unwrap_or(0.0)
                + sparse_weight * sparse_score.unwrap_or(0.0);

            Some(ScoredCandidate {
                document: Arc::clone(document),
                dense_score,
                sparse_score,
                fused_score: fused,
                rerank_score: None,
                channel,
            })
        })
        .collect();

    sort_by_fused(&mut candidates);
    candidates.truncate(k);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use crate::snapshot::IndexBuilder;
    use crate::vector_store::DenseIndex;
    use async_trait::async_trait;
    use medirag_core::{Document, DocumentKind};
    use std::collections::HashSet;

    const DIM: usize = 64;

    fn corpus() -> Vec<Document> {
        vec![
            Document::new("A", DocumentKind::Drug, "두통 진통제"),
            Document::new("B", DocumentKind::Drug, "소화제 위장약"),
        ]
    }

    async fn snapshot(docs: Vec<Document>) -> Arc<CorpusSnapshot> {
        let builder = IndexBuilder::new(Arc::new(HashEmbedder::new(DIM)));
        Arc::new(builder.build(DocumentKind::Drug, docs, 1).await.unwrap())
    }

    fn query_vector(text: &str) -> Vec<f32> {
        HashEmbedder::new(DIM).embed_sync(text)
    }

    /// Dense index that always errors or stalls
    struct BrokenDense {
        stall: bool,
    }

    #[async_trait]
    impl DenseIndex for BrokenDense {
        fn dimension(&self) -> usize {
            DIM
        }

        fn len(&self) -> usize {
            0
        }

        async fn upsert(&self, _id: &str, _vector: Vec<f32>) -> Result<(), RagError> {
            Ok(())
        }

        async fn query(&self, _vector: &[f32], _k: usize) -> Result<Vec<DenseHit>, RagError> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(RagError::Connection("connection refused".to_string()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    async fn snapshot_with_broken_dense(stall: bool) -> Arc<CorpusSnapshot> {
        let base = snapshot(corpus()).await;
        let docs = vec![
            Arc::clone(base.document("A").unwrap()),
            Arc::clone(base.document("B").unwrap()),
        ];
        Arc::new(CorpusSnapshot::new(
            DocumentKind::Drug,
            2,
            docs,
            Arc::clone(base.lexical()),
            Arc::new(BrokenDense { stall }),
        ))
    }

    fn engine() -> HybridFusionEngine {
        HybridFusionEngine::new(FusionConfig {
            dense_timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_headache_ranks_a_first() {
        let snap = snapshot(corpus()).await;
        let outcome = engine()
            .fuse(&snap, "두통", &query_vector("두통"), 2)
            .await
            .unwrap();

        assert_eq!(outcome.candidates[0].id(), "A");
        assert_eq!(outcome.candidates[0].sparse_score, Some(1.0));
        assert!(outcome.candidates.iter().all(|c| c.id() != "B" || c.sparse_score.is_none()));
        assert!(outcome.degraded_channels().is_empty());
    }

    #[tokio::test]
    async fn test_output_bounded_and_unique() {
        let docs: Vec<Document> = (0..12)
            .map(|i| Document::new(format!("D{:02}", i), DocumentKind::Drug, format!("두통 약 {}", i)))
            .collect();
        let snap = snapshot(docs).await;
        let outcome = engine()
            .fuse(&snap, "두통", &query_vector("두통"), 5)
            .await
            .unwrap();

        assert_eq!(outcome.candidates.len(), 5);
        let ids: HashSet<_> = outcome.candidates.iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn test_fewer_candidates_than_k() {
        let snap = snapshot(corpus()).await;
        let outcome = engine()
            .fuse(&snap, "두통", &query_vector("두통"), 5)
            .await
            .unwrap();
        assert_eq!(outcome.candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_dense_failure_degrades_to_sparse_only() {
        let snap = snapshot_with_broken_dense(false).await;
        let outcome = engine()
            .fuse(&snap, "두통", &query_vector("두통"), 5)
            .await
            .unwrap();

        assert!(matches!(outcome.dense.status, ChannelStatus::Failed(_)));
        assert_eq!(outcome.degraded_channels(), vec!["dense"]);
        assert_eq!(outcome.candidates.len(), 1);

        let top = &outcome.candidates[0];
        assert_eq!(top.id(), "A");
        assert_eq!(top.channel, MatchChannel::Sparse);
        assert!(top.dense_score.is_none());
        // single channel: fused = weight * normalized score
        assert!((top.fused_score - rag::SPARSE_WEIGHT * 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_dense_timeout_degrades_to_sparse_only() {
        let snap = snapshot_with_broken_dense(true).await;
        let outcome = engine()
            .fuse(&snap, "두통", &query_vector("두통"), 5)
            .await
            .unwrap();

        assert_eq!(outcome.dense.status, ChannelStatus::TimedOut);
        assert_eq!(outcome.candidates[0].id(), "A");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let snap = snapshot(corpus()).await;
        let err = engine().fuse(&snap, "두통", &[1.0, 0.0], 5).await.unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: DIM, actual: 2 }));
    }

    #[tokio::test]
    async fn test_fusion_is_idempotent() {
        let snap = snapshot(corpus()).await;
        let engine = engine();
        let vector = query_vector("두통 진통제");

        let first = engine.fuse(&snap, "두통 진통제", &vector, 5).await.unwrap();
        let second = engine.fuse(&snap, "두통 진통제", &vector, 5).await.unwrap();

        let summarize = |o: &FusionOutcome| {
            o.candidates
                .iter()
                .map(|c| (c.id().to_string(), c.fused_score))
                .collect::<Vec<_>>()
        };
        assert_eq!(summarize(&first), summarize(&second));
    }

    #[tokio::test]
    async fn test_empty_snapshot_yields_empty_outcome() {
        let snap = Arc::new(CorpusSnapshot::empty(DocumentKind::Drug, DIM));
        let outcome = engine()
            .fuse(&snap, "두통", &query_vector("두통"), 5)
            .await
            .unwrap();
        assert!(outcome.candidates.is_empty());
    }

    #[test]
    fn test_dense_normalization_shifts_negative_batches() {
        let hits = vec![
            DenseHit { id: "a".into(), score: 0.5 },
            DenseHit { id: "b".into(), score: -0.5 },
        ];
        let normalized = normalize_dense(&hits);
        assert_eq!(normalized[0].1, 0.75);
        assert_eq!(normalized[1].1, 0.25);

        let positive = vec![DenseHit { id: "a".into(), score: 0.4 }];
        assert_eq!(normalize_dense(&positive)[0].1, 0.4);
    }

    #[test]
    fn test_sparse_normalization() {
        let hits = vec![
            SparseHit { id: "a".into(), score: 4.0 },
            SparseHit { id: "b".into(), score: 1.0 },
        ];
        let normalized = normalize_sparse(&hits);
        assert_eq!(normalized[0].1, 1.0);
        assert_eq!(normalized[1].1, 0.25);

        let zero = vec![SparseHit { id: "a".into(), score: 0.0 }];
        assert_eq!(normalize_sparse(&zero)[0].1, 0.0);
    }

    #[test]
    fn test_weight_validation() {
        let zero = FusionConfig {
            dense_weight: 0.0,
            sparse_weight: 0.0,
            ..Default::default()
        };
        assert!(HybridFusionEngine::new(zero).is_err());

        let negative = FusionConfig {
            dense_weight: -0.1,
            ..Default::default()
        };
        assert!(HybridFusionEngine::new(negative).is_err());

        let nan = FusionConfig {
            sparse_weight: f32::NAN,
            ..Default::default()
        };
        assert!(HybridFusionEngine::new(nan).is_err());
    }

    #[test]
    fn test_fetch_size() {
        assert_eq!(engine().fetch_size(5), 15);
        assert_eq!(engine().fetch_size(0), 0);
    }
}
