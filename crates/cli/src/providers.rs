//! Provider construction from settings
//!
//! Every provider is built once here and handed to the orchestrator as a
//! trait object.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use medirag_agent::{
    InMemoryResponseCache, InMemorySessionStore, OrchestratorConfig, RagOrchestrator,
    ResponseSynthesizer, SynthesisConfig,
};
use medirag_config::constants::endpoints;
use medirag_config::{
    BackendKind, EmbeddingProviderKind, RerankerProviderKind, Settings,
};
use medirag_core::{DocumentKind, EmbeddingProvider, RerankProvider};
use medirag_rag::{
    Bm25Params, CohereReranker, CohereRerankerConfig, FusionConfig, HashEmbedder, IndexBackend,
    IndexBuilder, KnowledgeBase, KnowledgeLoader, LexicalOverlapReranker, OllamaEmbedder,
    OllamaEmbeddingConfig, OpenAIEmbedder, OpenAIEmbeddingConfig, QueryExpander, RerankConfig,
    RerankStage, Tokenizer, VectorStoreConfig,
};

pub fn embedder(settings: &Settings) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    let cfg = &settings.embedding;

    let embedder: Arc<dyn EmbeddingProvider> = match cfg.provider {
        EmbeddingProviderKind::OpenAI => Arc::new(OpenAIEmbedder::new(OpenAIEmbeddingConfig {
            endpoint: cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| endpoints::OPENAI_DEFAULT.to_string()),
            api_key: cfg.api_key.clone().unwrap_or_default(),
            model: cfg.model.clone(),
            dimension: cfg.dimension,
            timeout: cfg.timeout(),
        })?),
        EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedder::new(OllamaEmbeddingConfig {
            endpoint: cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| endpoints::OLLAMA_DEFAULT.to_string()),
            model: cfg.model.clone(),
            embedding_dim: cfg.dimension,
            timeout: cfg.timeout(),
        })?),
        EmbeddingProviderKind::Hash => Arc::new(HashEmbedder::new(cfg.dimension)),
    };

    tracing::info!(
        provider = embedder.name(),
        dimension = embedder.dimension(),
        "Embedding provider ready"
    );
    Ok(embedder)
}

pub fn reranker(settings: &Settings) -> anyhow::Result<RerankStage> {
    let cfg = &settings.reranker;
    if !cfg.enabled {
        tracing::info!("Reranking disabled");
        return Ok(RerankStage::disabled());
    }

    let provider: Arc<dyn RerankProvider> = match cfg.provider {
        RerankerProviderKind::Cohere => match cfg.api_key.clone() {
            Some(api_key) => Arc::new(CohereReranker::new(CohereRerankerConfig {
                endpoint: cfg.endpoint.clone(),
                api_key,
                model: cfg.model.clone(),
                timeout: cfg.timeout(),
            })?),
            None => {
                tracing::warn!("No Cohere API key, reranking disabled");
                return Ok(RerankStage::disabled());
            },
        },
        RerankerProviderKind::Lexical => Arc::new(LexicalOverlapReranker::new(Tokenizer::new(
            settings.rag.ngram_width,
        ))),
    };

    tracing::info!(provider = provider.name(), top_n = cfg.top_n, "Reranker ready");
    Ok(RerankStage::new(RerankConfig::from(cfg), Some(provider)))
}

pub fn synthesizer(settings: &Settings) -> ResponseSynthesizer {
    match medirag_llm::create_language_model(&settings.llm) {
        Ok(llm) => {
            tracing::info!(model = llm.model_name(), "Language model ready");
            ResponseSynthesizer::new(
                SynthesisConfig::from_settings(&settings.llm, &settings.memory),
                llm,
            )
        },
        Err(e) => {
            tracing::warn!(error = %e, "Language model unavailable, narratives disabled");
            ResponseSynthesizer::disabled()
        },
    }
}

/// Load the corpus, build snapshots and publish them
pub async fn knowledge_base(
    settings: &Settings,
    embedder: Arc<dyn EmbeddingProvider>,
) -> anyhow::Result<Arc<KnowledgeBase>> {
    let rag = &settings.rag;
    let knowledge = Arc::new(KnowledgeBase::new());

    let backend = match rag.backend {
        BackendKind::Memory => IndexBackend::Memory,
        BackendKind::Qdrant => IndexBackend::Qdrant(VectorStoreConfig {
            endpoint: rag.qdrant_endpoint.clone(),
            collection: rag.qdrant_collection.clone(),
            vector_dim: embedder.dimension(),
            api_key: rag.qdrant_api_key.clone(),
        }),
    };

    let builder = IndexBuilder::new(embedder)
        .with_backend(backend)
        .with_tokenizer(Tokenizer::new(rag.ngram_width))
        .with_bm25_params(Bm25Params {
            k1: rag.bm25_k1,
            b: rag.bm25_b,
        })
        .with_query_expansion(rag.query_expansion.then(QueryExpander::korean_symptoms))
        .with_tantivy_path(rag.tantivy_index_path.as_ref().map(PathBuf::from))
        .with_batch_size(settings.embedding.batch_size);

    let drugs_path = PathBuf::from(&settings.corpus.drugs_path);
    let drugs = KnowledgeLoader::load_drugs(&drugs_path)
        .with_context(|| format!("loading drugs from {}", drugs_path.display()))?;
    let snapshot = builder
        .build(DocumentKind::Drug, drugs, knowledge.next_generation())
        .await
        .context("building drug index")?;
    knowledge
        .replace(snapshot)
        .await
        .context("publishing drug index")?;

    if let Some(path) = &settings.corpus.diseases_path {
        let path = PathBuf::from(path);
        if path.exists() {
            let diseases = KnowledgeLoader::load_diseases(&path)
                .with_context(|| format!("loading diseases from {}", path.display()))?;
            let snapshot = builder
                .build(DocumentKind::Disease, diseases, knowledge.next_generation())
                .await
                .context("building disease index")?;
            knowledge
                .replace(snapshot)
                .await
                .context("publishing disease index")?;
        } else {
            tracing::warn!(path = %path.display(), "Disease corpus not found, skipping");
        }
    }

    Ok(knowledge)
}

/// Wire every stage into an orchestrator
pub async fn orchestrator(settings: &Settings) -> anyhow::Result<RagOrchestrator> {
    let embedder = embedder(settings)?;
    let knowledge = knowledge_base(settings, embedder.clone()).await?;

    let mut orchestrator = RagOrchestrator::new(
        OrchestratorConfig::from_settings(settings),
        FusionConfig::from(&settings.rag),
        knowledge,
        embedder,
    )?
    .with_reranker(reranker(settings)?)
    .with_synthesizer(synthesizer(settings));

    if settings.memory.enabled {
        orchestrator = orchestrator
            .with_memory(Arc::new(InMemorySessionStore::from_settings(&settings.memory)))
            .with_cache(Arc::new(InMemoryResponseCache::new()));
    }

    Ok(orchestrator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use medirag_agent::RecommendationRequest;

    fn offline_settings(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.embedding.provider = EmbeddingProviderKind::Hash;
        settings.embedding.dimension = 256;
        settings.reranker.provider = RerankerProviderKind::Lexical;
        settings.corpus.drugs_path = dir.join("drugs.json").display().to_string();
        settings.corpus.diseases_path = Some(dir.join("missing.json").display().to_string());
        settings
    }

    fn write_drugs(dir: &std::path::Path) {
        let drugs = r#"[
            {"id": "D001", "item_name": "타이레놀정", "efficacy": "두통, 치통, 발열"},
            {"id": "D002", "item_name": "베아제정", "efficacy": "소화불량, 과식"}
        ]"#;
        std::fs::write(dir.join("drugs.json"), drugs).unwrap();
    }

    #[tokio::test]
    async fn test_knowledge_base_skips_missing_diseases() {
        let dir = tempfile::tempdir().unwrap();
        write_drugs(dir.path());
        let settings = offline_settings(dir.path());

        let embedder = embedder(&settings).unwrap();
        let knowledge = knowledge_base(&settings, embedder).await.unwrap();

        assert_eq!(knowledge.snapshot(DocumentKind::Drug).unwrap().len(), 2);
        assert!(knowledge.snapshot(DocumentKind::Disease).is_none());
    }

    #[tokio::test]
    async fn test_missing_drug_corpus_fails() {
        let dir = tempfile::tempdir().unwrap();
        let settings = offline_settings(dir.path());

        let embedder = embedder(&settings).unwrap();
        assert!(knowledge_base(&settings, embedder).await.is_err());
    }

    #[test]
    fn test_cohere_without_key_disables_reranking() {
        let mut settings = Settings::default();
        settings.reranker.provider = RerankerProviderKind::Cohere;
        settings.reranker.api_key = None;

        assert!(!reranker(&settings).unwrap().is_active());
    }

    #[tokio::test]
    async fn test_offline_orchestrator_answers() {
        let dir = tempfile::tempdir().unwrap();
        write_drugs(dir.path());
        let settings = offline_settings(dir.path());

        let orchestrator = orchestrator(&settings).await.unwrap();
        let result = orchestrator
            .recommend(RecommendationRequest::new("두통이 있어요"))
            .await
            .unwrap();

        assert_eq!(result.candidates[0].id(), "D001");
        // No API key, so no generator
        assert!(result.narrative.is_none());
    }
}
