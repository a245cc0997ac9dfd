//! Recommendation orchestrator
//!
//! The only component that knows every stage. One request is one task:
//!
//! ```text
//! validate → cache? → embed → {dense ∥ sparse} → fuse → rerank? → synthesize? → store
//! ```
//!
//! Only a failed query embedding (or a configuration fault) fails the
//! request. Every later provider failure degrades its own stage and is
//! reported in [`RecommendationResult::degradations`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use medirag_config::Settings;
use medirag_core::{
    CachedResponse, ConversationTurn, DocumentKind, EmbeddingProvider, Error, ResponseCache,
    Result, ScoredCandidate, SessionMemoryStore, SourceRef,
};
use medirag_rag::{
    CorpusSnapshot, FusionConfig, FusionOutcome, HybridFusionEngine, KnowledgeBase, RerankStage,
    RerankStatus,
};

use crate::memory::cache_key;
use crate::request::{Degradation, RecommendationRequest, RecommendationResult, StageTimings};
use crate::stage::{PipelineStage, StageTrace};
use crate::synthesizer::ResponseSynthesizer;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_query_chars: usize,
    pub max_top_k: usize,
    /// Disease records returned alongside drugs
    pub disease_top_k: usize,
    pub embedding_timeout: Duration,
    pub memory_enabled: bool,
    pub cache_enabled: bool,
    /// Prior turns given to the synthesizer
    pub context_window: usize,
    pub cache_ttl: Duration,
    /// Per-call budget for memory and cache operations
    pub memory_timeout: Duration,
    pub disclaimer: String,
    pub always_disclaim: bool,
    pub no_results_message: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_query_chars: settings.rag.max_query_chars,
            max_top_k: settings.rag.max_top_k,
            disease_top_k: settings.rag.disease_top_k,
            embedding_timeout: settings.embedding.timeout(),
            memory_enabled: settings.memory.enabled,
            cache_enabled: settings.memory.cache_enabled,
            context_window: settings.memory.context_window,
            cache_ttl: settings.memory.cache_ttl(),
            memory_timeout: settings.memory.timeout(),
            disclaimer: settings.response.disclaimer.clone(),
            always_disclaim: settings.response.always_disclaim,
            no_results_message: settings.response.no_results_message.clone(),
        }
    }
}

/// Hybrid recommendation pipeline
pub struct RagOrchestrator {
    config: OrchestratorConfig,
    knowledge: Arc<KnowledgeBase>,
    embedder: Arc<dyn EmbeddingProvider>,
    fusion: HybridFusionEngine,
    reranker: RerankStage,
    synthesizer: ResponseSynthesizer,
    memory: Option<Arc<dyn SessionMemoryStore>>,
    cache: Option<Arc<dyn ResponseCache>>,
}

impl RagOrchestrator {
    /// Orchestrator with fusion only; reranking, synthesis and memory are
    /// added with the `with_*` methods
    pub fn new(
        config: OrchestratorConfig,
        fusion: FusionConfig,
        knowledge: Arc<KnowledgeBase>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let fusion = HybridFusionEngine::new(fusion)?;
        Ok(Self {
            config,
            knowledge,
            embedder,
            fusion,
            reranker: RerankStage::disabled(),
            synthesizer: ResponseSynthesizer::disabled(),
            memory: None,
            cache: None,
        })
    }

    pub fn with_reranker(mut self, reranker: RerankStage) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: ResponseSynthesizer) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn SessionMemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one recommendation request
    pub async fn recommend(&self, request: RecommendationRequest) -> Result<RecommendationResult> {
        self.recommend_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Run one request, aborting with [`Error::Cancelled`] when `cancel` fires
    ///
    /// Requests only read published snapshots, so an aborted request leaves
    /// no partial state behind.
    pub async fn recommend_with_cancel(
        &self,
        request: RecommendationRequest,
        cancel: CancellationToken,
    ) -> Result<RecommendationResult> {
        let start = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.run(request) => result,
        };

        let outcome = match &result {
            Ok(r) if r.from_cache => "cache",
            Ok(r) if r.is_degraded() => "degraded",
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!("medirag_requests_total", "outcome" => outcome).increment(1);

        match &result {
            Ok(r) => tracing::info!(
                results = r.candidates.len(),
                diseases = r.diseases.len(),
                narrative = r.narrative.is_some(),
                from_cache = r.from_cache,
                degraded = r.is_degraded(),
                total_ms = start.elapsed().as_millis() as u64,
                "Recommendation complete"
            ),
            Err(Error::Validation(msg)) => tracing::debug!(error = %msg, "Rejected request"),
            Err(e) => tracing::warn!(
                error = %e,
                total_ms = start.elapsed().as_millis() as u64,
                "Recommendation failed"
            ),
        }

        result
    }

    async fn run(&self, request: RecommendationRequest) -> Result<RecommendationResult> {
        let start = Instant::now();
        let query = request.validate(self.config.max_query_chars, self.config.max_top_k)?;
        let top_k = request.top_k;

        let memory_active = request.use_memory && self.config.memory_enabled && self.memory.is_some();
        let session_id = request
            .session_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| memory_active.then(|| uuid::Uuid::new_v4().to_string()));

        let mut degradations = Vec::new();

        if let Some(session) = session_id.as_deref().filter(|_| memory_active) {
            let key = cache_key(session, &query, top_k, request.include_diseases);
            if let Some(hit) = self.cached(&key, &mut degradations).await {
                return Ok(self
                    .from_cache(hit, &request, query, session, start, degradations)
                    .await);
            }
        }

        let mut trace = StageTrace::new();
        let mut timings = StageTimings::default();

        // Embedding
        let stage_start = Instant::now();
        let query_vector = match self.embed_query(&query).await {
            Ok(vector) => vector,
            Err(err) => {
                trace.fail();
                return Err(err);
            },
        };
        timings.embedding_ms = record_stage(PipelineStage::Embedding, stage_start);

        // Retrieving ∥ fusing
        trace.advance(PipelineStage::Retrieving);
        let stage_start = Instant::now();
        let fetch = if self.reranker.is_active() {
            top_k.max(self.reranker.input_size())
        } else {
            top_k
        };

        let drug_snapshot = self.snapshot(DocumentKind::Drug);
        let disease_snapshot = if request.include_diseases && self.config.disease_top_k > 0 {
            self.knowledge
                .snapshot(DocumentKind::Disease)
                .filter(|s| !s.is_empty())
        } else {
            None
        };

        let (drugs, diseases) = tokio::join!(
            self.fusion.fuse(&drug_snapshot, &query, &query_vector, fetch),
            async {
                match &disease_snapshot {
                    Some(snapshot) => Some(
                        self.fusion
                            .fuse(snapshot, &query, &query_vector, self.config.disease_top_k)
                            .await,
                    ),
                    None => None,
                }
            }
        );

        let drugs = match drugs {
            Ok(outcome) => outcome,
            Err(err) => {
                trace.fail();
                return Err(err.into());
            },
        };
        let diseases = match diseases {
            Some(Ok(outcome)) => {
                note_channels("disease", &outcome, &mut degradations);
                outcome.candidates
            },
            Some(Err(err)) => {
                trace.fail();
                return Err(err.into());
            },
            None => Vec::new(),
        };

        note_channels("drug", &drugs, &mut degradations);
        timings.dense_ms = drugs.dense.elapsed_ms;
        timings.sparse_ms = drugs.sparse.elapsed_ms;
        trace.advance(PipelineStage::Fusing);
        timings.fusion_ms = record_stage(PipelineStage::Fusing, stage_start);

        // Reranking
        let mut candidates = drugs.candidates;
        if self.reranker.should_apply(candidates.len()) {
            trace.advance(PipelineStage::Reranking);
            let stage_start = Instant::now();
            let outcome = self.reranker.apply(&query, candidates).await;
            if let RerankStatus::Failed(reason) = &outcome.status {
                metrics::counter!("medirag_channel_failures_total", "channel" => "rerank")
                    .increment(1);
                degradations.push(Degradation::new("rerank", reason.clone()));
            }
            candidates = outcome.candidates;
            timings.rerank_ms = record_stage(PipelineStage::Reranking, stage_start);
        }
        candidates.truncate(top_k);

        // Synthesizing
        let mut narrative = None;
        if request.include_narrative && self.synthesizer.is_available() {
            trace.advance(PipelineStage::Synthesizing);
            let stage_start = Instant::now();

            let history = match session_id.as_deref().filter(|_| memory_active) {
                Some(session) => self.history(session, &mut degradations).await,
                None => Vec::new(),
            };

            match self
                .synthesizer
                .synthesize(&query, &candidates, &diseases, &history)
                .await
            {
                Ok(text) => narrative = Some(text),
                Err(err) => {
                    tracing::warn!(error = %err, "Synthesis failed, returning ranked candidates only");
                    degradations.push(Degradation::new("synthesis", err.to_string()));
                },
            }
            timings.synthesis_ms = record_stage(PipelineStage::Synthesizing, stage_start);
        }
        trace.advance(PipelineStage::Done);

        let mut conversation_turn = None;
        if let (Some(text), Some(session)) = (
            narrative.as_deref(),
            session_id.as_deref().filter(|_| memory_active),
        ) {
            conversation_turn = self
                .remember(session, &query, text, &candidates, &mut degradations)
                .await;
            let key = cache_key(session, &query, top_k, request.include_diseases);
            self.store_cache(&key, text, &candidates, &diseases, &mut degradations)
                .await;
        }

        if narrative.is_none()
            && request.include_narrative
            && candidates.is_empty()
            && diseases.is_empty()
        {
            narrative = Some(self.config.no_results_message.clone());
        }

        timings.total_results = candidates.len();
        timings.total_ms = start.elapsed().as_millis() as u64;

        Ok(RecommendationResult {
            query,
            disclaimer: self.disclaimer(narrative.is_some()),
            candidates,
            diseases,
            narrative,
            session_id,
            from_cache: false,
            conversation_turn,
            timings,
            degradations,
            trace,
        })
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let timeout = self.config.embedding_timeout;
        let vector = tokio::time::timeout(timeout, self.embedder.embed(query))
            .await
            .map_err(|_| Error::timeout("embedding", timeout))??;

        let expected = self.embedder.dimension();
        if vector.len() != expected {
            return Err(Error::Configuration(format!(
                "Query embedding has dimension {}, expected {}",
                vector.len(),
                expected
            )));
        }
        Ok(vector)
    }

    /// Published snapshot, or an empty one when nothing was loaded
    fn snapshot(&self, kind: DocumentKind) -> Arc<CorpusSnapshot> {
        self.knowledge.snapshot(kind).unwrap_or_else(|| {
            tracing::warn!(kind = %kind, "No snapshot published, searching an empty corpus");
            Arc::new(CorpusSnapshot::empty(kind, self.embedder.dimension()))
        })
    }

    fn disclaimer(&self, has_narrative: bool) -> Option<String> {
        (has_narrative || self.config.always_disclaim).then(|| self.config.disclaimer.clone())
    }

    async fn cached(
        &self,
        key: &str,
        degradations: &mut Vec<Degradation>,
    ) -> Option<CachedResponse> {
        if !self.config.cache_enabled {
            return None;
        }
        let cache = self.cache.as_ref()?;

        match tokio::time::timeout(self.config.memory_timeout, cache.get(key))
            .await
        {
            Ok(Ok(hit)) => hit,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Cache read failed");
                degradations.push(Degradation::new("cache", err.to_string()));
                None
            },
            Err(_) => {
                tracing::warn!("Cache read timed out");
                degradations.push(Degradation::new("cache", "timeout"));
                None
            },
        }
    }

    async fn from_cache(
        &self,
        hit: CachedResponse,
        request: &RecommendationRequest,
        query: String,
        session: &str,
        start: Instant,
        mut degradations: Vec<Degradation>,
    ) -> RecommendationResult {
        metrics::counter!("medirag_cache_hits_total").increment(1);
        tracing::debug!(session_id = session, cached_at = %hit.cached_at, "Serving cached response");

        let mut candidates = hit.candidates;
        candidates.truncate(request.top_k);
        let diseases = if request.include_diseases {
            hit.diseases
        } else {
            Vec::new()
        };
        let narrative = hit.narrative.filter(|_| request.include_narrative);

        let conversation_turn = match narrative.as_deref() {
            Some(text) => {
                self.remember(session, &query, text, &candidates, &mut degradations)
                    .await
            },
            None => None,
        };

        let timings = StageTimings {
            total_ms: start.elapsed().as_millis() as u64,
            total_results: candidates.len(),
            ..Default::default()
        };

        RecommendationResult {
            query,
            disclaimer: self.disclaimer(narrative.is_some()),
            candidates,
            diseases,
            narrative,
            session_id: Some(session.to_string()),
            from_cache: true,
            conversation_turn,
            timings,
            degradations,
            trace: StageTrace::new(),
        }
    }

    async fn history(&self, session: &str, degradations: &mut Vec<Degradation>) -> Vec<ConversationTurn> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };

        match tokio::time::timeout(
            self.config.memory_timeout,
            memory.get(session, self.config.context_window),
        )
        .await
        {
            Ok(Ok(turns)) => turns,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Memory read failed");
                degradations.push(Degradation::new("memory", err.to_string()));
                Vec::new()
            },
            Err(_) => {
                tracing::warn!("Memory read timed out");
                degradations.push(Degradation::new("memory", "timeout"));
                Vec::new()
            },
        }
    }

    async fn remember(
        &self,
        session: &str,
        query: &str,
        response: &str,
        candidates: &[ScoredCandidate],
        degradations: &mut Vec<Degradation>,
    ) -> Option<usize> {
        let memory = self.memory.as_ref()?;
        let sources = candidates
            .iter()
            .map(|c| SourceRef {
                id: c.id().to_string(),
                name: c.document.name.clone(),
                score: c.relevance(),
            })
            .collect();
        let turn = ConversationTurn::new(query, response).with_sources(sources);

        match tokio::time::timeout(self.config.memory_timeout, memory.append(session, turn)).await {
            Ok(Ok(count)) => Some(count),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Memory write failed");
                degradations.push(Degradation::new("memory", err.to_string()));
                None
            },
            Err(_) => {
                tracing::warn!("Memory write timed out");
                degradations.push(Degradation::new("memory", "timeout"));
                None
            },
        }
    }

    async fn store_cache(
        &self,
        key: &str,
        narrative: &str,
        candidates: &[ScoredCandidate],
        diseases: &[ScoredCandidate],
        degradations: &mut Vec<Degradation>,
    ) {
        if !self.config.cache_enabled {
            return;
        }
        let Some(cache) = &self.cache else {
            return;
        };

        let value = CachedResponse {
            narrative: Some(narrative.to_string()),
            candidates: candidates.to_vec(),
            diseases: diseases.to_vec(),
            cached_at: Utc::now(),
        };
        match tokio::time::timeout(
            self.config.memory_timeout,
            cache.put(key, value, self.config.cache_ttl),
        )
        .await
        {
            Ok(Ok(())) => {},
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Cache write failed");
                degradations.push(Degradation::new("cache", err.to_string()));
            },
            Err(_) => {
                tracing::warn!("Cache write timed out");
                degradations.push(Degradation::new("cache", "timeout"));
            },
        }
    }
}

fn record_stage(stage: PipelineStage, start: Instant) -> u64 {
    let ms = start.elapsed().as_millis() as u64;
    metrics::histogram!("medirag_stage_duration_ms", "stage" => stage.as_str()).record(ms as f64);
    ms
}

fn note_channels(corpus: &'static str, outcome: &FusionOutcome, degradations: &mut Vec<Degradation>) {
    for (channel, report) in [("dense", &outcome.dense), ("sparse", &outcome.sparse)] {
        if !report.status.is_ok() {
            metrics::counter!("medirag_channel_failures_total", "channel" => channel).increment(1);
            degradations.push(Degradation::new(
                format!("{}_{}", corpus, channel),
                format!("{:?}", report.status),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medirag_core::Document;
    use medirag_rag::{HashEmbedder, IndexBuilder};

    async fn orchestrator() -> RagOrchestrator {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(64));
        let knowledge = Arc::new(KnowledgeBase::new());
        let docs = vec![
            Document::new("D1", DocumentKind::Drug, "타이레놀정").with_field("efficacy", "두통, 발열"),
            Document::new("D2", DocumentKind::Drug, "개비스콘").with_field("efficacy", "속쓰림"),
        ];
        let snapshot = IndexBuilder::new(embedder.clone())
            .build(DocumentKind::Drug, docs, knowledge.next_generation())
            .await
            .unwrap();
        knowledge.publish(snapshot);

        RagOrchestrator::new(
            OrchestratorConfig::default(),
            FusionConfig::default(),
            knowledge,
            embedder,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_trace_without_rerank_or_narrative() {
        let orchestrator = orchestrator().await;
        let result = orchestrator
            .recommend(RecommendationRequest::new("두통").with_memory(false))
            .await
            .unwrap();

        assert_eq!(result.candidates[0].id(), "D1");
        assert_eq!(
            result.trace.stages(),
            vec![
                PipelineStage::Embedding,
                PipelineStage::Retrieving,
                PipelineStage::Fusing,
                PipelineStage::Done
            ]
        );
        assert!(result.narrative.is_none());
        assert!(result.session_id.is_none());
    }

    #[tokio::test]
    async fn test_disclaimer_always_attached_by_default() {
        let orchestrator = orchestrator().await;
        let result = orchestrator
            .recommend(RecommendationRequest::new("두통").with_narrative(false))
            .await
            .unwrap();
        assert!(result.disclaimer.unwrap().contains("참고용"));
    }

    #[tokio::test]
    async fn test_invalid_weights_rejected() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(8));
        let fusion = FusionConfig {
            dense_weight: 0.0,
            sparse_weight: 0.0,
            ..Default::default()
        };
        let result = RagOrchestrator::new(
            OrchestratorConfig::default(),
            fusion,
            Arc::new(KnowledgeBase::new()),
            embedder,
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_missing_snapshot_gives_empty_result() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(8));
        let orchestrator = RagOrchestrator::new(
            OrchestratorConfig::default(),
            FusionConfig::default(),
            Arc::new(KnowledgeBase::new()),
            embedder,
        )
        .unwrap();

        let result = orchestrator
            .recommend(RecommendationRequest::new("두통").with_narrative(false))
            .await
            .unwrap();
        assert!(result.candidates.is_empty());
        assert_eq!(result.timings.total_results, 0);
    }
}
