//! Corpus snapshots and atomic index swap
//!
//! A [`CorpusSnapshot`] bundles the documents of one kind with the lexical
//! and dense indexes built over them. Snapshots are immutable: a rebuild goes
//! through [`IndexBuilder`] and is published into the [`KnowledgeBase`] by
//! swapping an `Arc`. Requests clone the `Arc` once and keep reading the
//! snapshot they started with.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use medirag_config::constants::embedding;
use medirag_core::{Document, DocumentKind, EmbeddingProvider};

use crate::sparse_search::{Bm25Index, Bm25Params, LexicalIndex};
use crate::tantivy_index::TantivyLexicalIndex;
use crate::tokenizer::{QueryExpander, Tokenizer};
use crate::vector_store::{DenseIndex, InMemoryDenseIndex, QdrantDenseIndex, VectorStoreConfig};
use crate::RagError;

/// Immutable, fully built indexes over one corpus
pub struct CorpusSnapshot {
    kind: DocumentKind,
    generation: u64,
    documents: HashMap<String, Arc<Document>>,
    lexical: Arc<dyn LexicalIndex>,
    dense: Arc<dyn DenseIndex>,
    built_at: DateTime<Utc>,
}

impl CorpusSnapshot {
    pub fn new(
        kind: DocumentKind,
        generation: u64,
        documents: Vec<Arc<Document>>,
        lexical: Arc<dyn LexicalIndex>,
        dense: Arc<dyn DenseIndex>,
    ) -> Self {
        let documents = documents
            .into_iter()
            .map(|doc| (doc.id.clone(), doc))
            .collect();

        Self {
            kind,
            generation,
            documents,
            lexical,
            dense,
            built_at: Utc::now(),
        }
    }

    /// Snapshot with no documents
    pub fn empty(kind: DocumentKind, dimension: usize) -> Self {
        Self::new(
            kind,
            0,
            Vec::new(),
            Arc::new(Bm25Index::build(&[], Tokenizer::default(), Bm25Params::default())),
            Arc::new(InMemoryDenseIndex::new(dimension)),
        )
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn document(&self, id: &str) -> Option<&Arc<Document>> {
        self.documents.get(id)
    }

    pub fn lexical(&self) -> &Arc<dyn LexicalIndex> {
        &self.lexical
    }

    pub fn dense(&self) -> &Arc<dyn DenseIndex> {
        &self.dense
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }
}

impl std::fmt::Debug for CorpusSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorpusSnapshot")
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .field("documents", &self.documents.len())
            .field("lexical", &self.lexical.name())
            .field("dense", &self.dense.name())
            .finish()
    }
}

/// Published snapshots, one per document kind
#[derive(Default)]
pub struct KnowledgeBase {
    snapshots: RwLock<HashMap<DocumentKind, Arc<CorpusSnapshot>>>,
    generation: AtomicU64,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot for `kind`, if one was published
    pub fn snapshot(&self, kind: DocumentKind) -> Option<Arc<CorpusSnapshot>> {
        self.snapshots.read().get(&kind).cloned()
    }

    /// Generation number for the next build
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Swap in a new snapshot, returning the one it replaced
    ///
    /// The previous snapshot stays valid for requests still holding it.
    pub fn publish(&self, snapshot: CorpusSnapshot) -> Option<Arc<CorpusSnapshot>> {
        let kind = snapshot.kind;
        let generation = snapshot.generation;
        let documents = snapshot.len();

        let previous = self.snapshots.write().insert(kind, Arc::new(snapshot));

        tracing::info!(
            kind = %kind,
            generation,
            documents,
            replaced = previous.is_some(),
            "Published corpus snapshot"
        );
        previous
    }

    /// Publish a rebuilt snapshot and retire the dense index it replaced
    ///
    /// Requests still holding the old snapshot lose its dense channel once
    /// it is retired and continue on lexical results alone. A replaced
    /// snapshot of the same generation shares its storage and is left alone.
    pub async fn replace(
        &self,
        snapshot: CorpusSnapshot,
    ) -> Result<Option<Arc<CorpusSnapshot>>, RagError> {
        let generation = snapshot.generation;
        let previous = self.publish(snapshot);

        if let Some(old) = previous.as_ref().filter(|old| old.generation != generation) {
            old.dense.retire().await?;
            tracing::info!(
                kind = %old.kind,
                generation = old.generation,
                dense = old.dense.name(),
                "Retired replaced dense index"
            );
        }
        Ok(previous)
    }
}

/// Where dense vectors are stored
#[derive(Debug, Clone, Default)]
pub enum IndexBackend {
    /// Brute-force scan in process memory
    #[default]
    Memory,
    /// Qdrant; `collection` is used as a prefix, one collection per snapshot
    Qdrant(VectorStoreConfig),
}

/// Builds complete snapshots from loaded documents
pub struct IndexBuilder {
    embedder: Arc<dyn EmbeddingProvider>,
    backend: IndexBackend,
    tokenizer: Tokenizer,
    params: Bm25Params,
    expander: Option<QueryExpander>,
    tantivy_path: Option<PathBuf>,
    batch_size: usize,
}

impl IndexBuilder {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            backend: IndexBackend::Memory,
            tokenizer: Tokenizer::default(),
            params: Bm25Params::default(),
            expander: None,
            tantivy_path: None,
            batch_size: embedding::BATCH_SIZE,
        }
    }

    pub fn with_backend(mut self, backend: IndexBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Tokenizer) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn with_bm25_params(mut self, params: Bm25Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_query_expansion(mut self, expander: Option<QueryExpander>) -> Self {
        self.expander = expander;
        self
    }

    /// Use tantivy for the lexical channel, writing under `path`
    pub fn with_tantivy_path(mut self, path: Option<PathBuf>) -> Self {
        self.tantivy_path = path;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Embed and index `documents` into a new snapshot
    ///
    /// Duplicate ids keep the last occurrence. Nothing is published; the
    /// caller decides when to swap.
    pub async fn build(
        &self,
        kind: DocumentKind,
        documents: Vec<Document>,
        generation: u64,
    ) -> Result<CorpusSnapshot, RagError> {
        let documents = dedup_by_id(documents);
        let dimension = self.embedder.dimension();

        tracing::info!(
            kind = %kind,
            generation,
            documents = documents.len(),
            embedder = self.embedder.name(),
            "Building corpus snapshot"
        );

        let vectors = self.embed_all(&documents, dimension).await?;
        let dense = self.build_dense(kind, generation, dimension, &documents, vectors).await?;
        let lexical = self.build_lexical(kind, generation, documents.clone()).await?;

        Ok(CorpusSnapshot::new(kind, generation, documents, lexical, dense))
    }

    async fn embed_all(
        &self,
        documents: &[Arc<Document>],
        dimension: usize,
    ) -> Result<Vec<Vec<f32>>, RagError> {
        let mut vectors = Vec::with_capacity(documents.len());

        for chunk in documents.chunks(self.batch_size) {
            let texts: Vec<String> = chunk.iter().map(|d| d.retrieval_text()).collect();
            let batch = self
                .embedder
                .embed_batch(&texts)
                .await
                .map_err(embedding_error)?;

            if batch.len() != texts.len() {
                return Err(RagError::Embedding(format!(
                    "Expected {} embeddings, got {}",
                    texts.len(),
                    batch.len()
                )));
            }
            if let Some(bad) = batch.iter().find(|v| v.len() != dimension) {
                return Err(RagError::DimensionMismatch {
                    expected: dimension,
                    actual: bad.len(),
                });
            }
            vectors.extend(batch);

            tracing::debug!(embedded = vectors.len(), total = documents.len(), "Embedding progress");
        }

        Ok(vectors)
    }

    async fn build_dense(
        &self,
        kind: DocumentKind,
        generation: u64,
        dimension: usize,
        documents: &[Arc<Document>],
        vectors: Vec<Vec<f32>>,
    ) -> Result<Arc<dyn DenseIndex>, RagError> {
        let items: Vec<(String, Vec<f32>)> = documents
            .iter()
            .map(|d| d.id.clone())
            .zip(vectors)
            .collect();

        let dense: Arc<dyn DenseIndex> = match &self.backend {
            IndexBackend::Memory => Arc::new(InMemoryDenseIndex::new(dimension)),
            IndexBackend::Qdrant(config) => {
                let config = VectorStoreConfig {
                    collection: format!("{}_{}_{}", config.collection, kind, generation),
                    vector_dim: dimension,
                    ..config.clone()
                };
                Arc::new(QdrantDenseIndex::connect(config).await?)
            },
        };

        dense.upsert_batch(items).await?;
        Ok(dense)
    }

    async fn build_lexical(
        &self,
        kind: DocumentKind,
        generation: u64,
        documents: Vec<Arc<Document>>,
    ) -> Result<Arc<dyn LexicalIndex>, RagError> {
        let tokenizer = self.tokenizer.clone();
        let params = self.params;
        let expander = self.expander.clone();
        let tantivy_dir = self
            .tantivy_path
            .as_ref()
            .map(|root| root.join(format!("{}-{}", kind, generation)));

        tokio::task::spawn_blocking(move || -> Result<Arc<dyn LexicalIndex>, RagError> {
            match tantivy_dir {
                Some(dir) => {
                    let mut index = TantivyLexicalIndex::build(&documents, tokenizer, Some(&dir))?;
                    if let Some(expander) = expander {
                        index = index.with_query_expansion(expander);
                    }
                    Ok(Arc::new(index))
                },
                None => {
                    let mut index = Bm25Index::build(&documents, tokenizer, params);
                    if let Some(expander) = expander {
                        index = index.with_query_expansion(expander);
                    }
                    Ok(Arc::new(index))
                },
            }
        })
        .await
        .map_err(|e| RagError::Index(format!("Lexical build task failed: {}", e)))?
    }
}

fn dedup_by_id(documents: Vec<Document>) -> Vec<Arc<Document>> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Arc<Document>> = Vec::with_capacity(documents.len());

    for doc in documents {
        match positions.get(&doc.id) {
            Some(&pos) => {
                tracing::debug!(id = %doc.id, "Duplicate document id, keeping last");
                out[pos] = Arc::new(doc);
            },
            None => {
                positions.insert(doc.id.clone(), out.len());
                out.push(Arc::new(doc));
            },
        }
    }
    out
}

fn embedding_error(err: medirag_core::Error) -> RagError {
    match err {
        medirag_core::Error::Configuration(msg) => RagError::Configuration(msg),
        other => RagError::Embedding(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use crate::vector_store::DenseHit;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Dense index that only counts retire calls
    struct RetireCounting {
        retired: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DenseIndex for RetireCounting {
        fn dimension(&self) -> usize {
            4
        }

        fn len(&self) -> usize {
            0
        }

        async fn upsert(&self, _id: &str, _vector: Vec<f32>) -> Result<(), RagError> {
            Ok(())
        }

        async fn query(&self, _vector: &[f32], _k: usize) -> Result<Vec<DenseHit>, RagError> {
            Ok(Vec::new())
        }

        async fn retire(&self) -> Result<(), RagError> {
            self.retired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "retire-counting"
        }
    }

    fn counted_snapshot(generation: u64, retired: &Arc<AtomicUsize>) -> CorpusSnapshot {
        CorpusSnapshot::new(
            DocumentKind::Drug,
            generation,
            Vec::new(),
            Arc::new(Bm25Index::build(&[], Tokenizer::default(), Bm25Params::default())),
            Arc::new(RetireCounting {
                retired: Arc::clone(retired),
            }),
        )
    }

    fn drug(id: &str, name: &str) -> Document {
        Document::new(id, DocumentKind::Drug, name)
    }

    #[tokio::test]
    async fn test_build_and_publish() {
        let builder = IndexBuilder::new(Arc::new(HashEmbedder::new(32)));
        let kb = KnowledgeBase::new();
        assert!(kb.snapshot(DocumentKind::Drug).is_none());

        let generation = kb.next_generation();
        let snapshot = builder
            .build(
                DocumentKind::Drug,
                vec![drug("A", "두통 진통제"), drug("B", "소화제")],
                generation,
            )
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.lexical().len(), 2);
        assert_eq!(snapshot.dense().len(), 2);

        assert!(kb.publish(snapshot).is_none());
        let current = kb.snapshot(DocumentKind::Drug).unwrap();
        assert_eq!(current.generation(), 1);
        assert!(current.document("A").is_some());
    }

    #[tokio::test]
    async fn test_readers_keep_old_snapshot_after_swap() {
        let builder = IndexBuilder::new(Arc::new(HashEmbedder::new(16)));
        let kb = KnowledgeBase::new();

        let first = builder
            .build(DocumentKind::Drug, vec![drug("A", "두통")], kb.next_generation())
            .await
            .unwrap();
        kb.publish(first);
        let held = kb.snapshot(DocumentKind::Drug).unwrap();

        let second = builder
            .build(
                DocumentKind::Drug,
                vec![drug("A", "두통"), drug("B", "감기")],
                kb.next_generation(),
            )
            .await
            .unwrap();
        let replaced = kb.publish(second).unwrap();

        assert_eq!(held.len(), 1);
        assert_eq!(replaced.generation(), held.generation());
        assert_eq!(kb.snapshot(DocumentKind::Drug).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replace_retires_previous_dense_index() {
        let kb = KnowledgeBase::new();
        let first_retired = Arc::new(AtomicUsize::new(0));
        let second_retired = Arc::new(AtomicUsize::new(0));

        assert!(kb.replace(counted_snapshot(1, &first_retired)).await.unwrap().is_none());
        assert_eq!(first_retired.load(Ordering::SeqCst), 0);

        let replaced = kb.replace(counted_snapshot(2, &second_retired)).await.unwrap();
        assert_eq!(replaced.unwrap().generation(), 1);
        assert_eq!(first_retired.load(Ordering::SeqCst), 1);
        assert_eq!(second_retired.load(Ordering::SeqCst), 0);
        assert_eq!(kb.snapshot(DocumentKind::Drug).unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn test_replace_same_generation_keeps_dense_index() {
        let kb = KnowledgeBase::new();
        let retired = Arc::new(AtomicUsize::new(0));

        kb.replace(counted_snapshot(1, &retired)).await.unwrap();
        kb.replace(counted_snapshot(1, &retired)).await.unwrap();
        assert_eq!(retired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_ids_keep_last() {
        let builder = IndexBuilder::new(Arc::new(HashEmbedder::new(16)));
        let snapshot = builder
            .build(
                DocumentKind::Drug,
                vec![drug("A", "구버전"), drug("A", "신버전")],
                1,
            )
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.document("A").unwrap().name, "신버전");
    }

    #[tokio::test]
    async fn test_empty_corpus_builds_empty_snapshot() {
        let builder = IndexBuilder::new(Arc::new(HashEmbedder::new(16)));
        let snapshot = builder.build(DocumentKind::Disease, Vec::new(), 1).await.unwrap();
        assert!(snapshot.is_empty());
        assert!(snapshot.lexical().is_empty());
    }

    #[tokio::test]
    async fn test_tantivy_rebuild_after_restart() {
        let dir = tempfile::tempdir().unwrap();

        // Each pass stands for a fresh process: a new knowledge base whose
        // generation counter starts over
        for (pass, name) in ["두통 진통제", "감기약"].iter().enumerate() {
            let kb = KnowledgeBase::new();
            let builder = IndexBuilder::new(Arc::new(HashEmbedder::new(16)))
                .with_tantivy_path(Some(dir.path().to_path_buf()));
            let snapshot = builder
                .build(DocumentKind::Drug, vec![drug("A", name)], kb.next_generation())
                .await
                .unwrap_or_else(|e| panic!("pass {} failed: {}", pass, e));
            assert_eq!(snapshot.generation(), 1);
            assert_eq!(snapshot.lexical().len(), 1);
            kb.publish(snapshot);
        }

        let rebuilt = IndexBuilder::new(Arc::new(HashEmbedder::new(16)))
            .with_tantivy_path(Some(dir.path().to_path_buf()))
            .build(DocumentKind::Drug, vec![drug("B", "소화제")], 1)
            .await
            .unwrap();
        assert!(rebuilt.lexical().search("감기", 5).unwrap().is_empty());
        assert_eq!(rebuilt.lexical().search("소화제", 5).unwrap()[0].id, "B");
    }

    #[tokio::test]
    async fn test_tantivy_backend_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let builder = IndexBuilder::new(Arc::new(HashEmbedder::new(16)))
            .with_tantivy_path(Some(dir.path().to_path_buf()));
        let snapshot = builder
            .build(DocumentKind::Drug, vec![drug("A", "두통 진통제")], 3)
            .await
            .unwrap();
        assert_eq!(snapshot.lexical().name(), "tantivy");
        assert!(dir.path().join("drug-3").exists());
    }
}
