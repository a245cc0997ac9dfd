//! Dense vector storage and cosine similarity search
//!
//! Two backends implement [`DenseIndex`]:
//! - [`InMemoryDenseIndex`]: brute-force scan, exact, fine for ~10^4 documents
//! - [`QdrantDenseIndex`]: Qdrant collection with cosine distance

use async_trait::async_trait;
use parking_lot::RwLock;
use qdrant_client::{
    qdrant::{
        value::Kind, CreateCollectionBuilder, DeleteCollectionBuilder, Distance, PointStruct,
        SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
    },
    Qdrant,
};
use std::collections::{BTreeMap, HashMap, HashSet};

use medirag_config::constants::endpoints;

use crate::RagError;

/// Payload key holding the document id in Qdrant
const DOC_ID_KEY: &str = "doc_id";

/// Dense search hit with raw cosine similarity
#[derive(Debug, Clone, PartialEq)]
pub struct DenseHit {
    pub id: String,
    pub score: f32,
}

/// Dense index contract
///
/// Every stored vector has the index dimension. Queries with a different
/// dimension fail with [`RagError::DimensionMismatch`] before any search.
#[async_trait]
pub trait DenseIndex: Send + Sync + 'static {
    fn dimension(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Associate a vector with a document id, replacing any previous vector
    async fn upsert(&self, id: &str, vector: Vec<f32>) -> Result<(), RagError>;

    async fn upsert_batch(&self, items: Vec<(String, Vec<f32>)>) -> Result<(), RagError> {
        for (id, vector) in items {
            self.upsert(&id, vector).await?;
        }
        Ok(())
    }

    /// Top `k` by cosine similarity, descending, ties by id
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<DenseHit>, RagError>;

    /// Release backing storage once no snapshot refers to it
    async fn retire(&self) -> Result<(), RagError> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

fn check_dimension(expected: usize, actual: usize) -> Result<(), RagError> {
    if expected != actual {
        return Err(RagError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

fn sort_hits(hits: &mut [DenseHit]) {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
}

/// Cosine similarity; zero vectors have similarity 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = norm(a);
    let norm_b = norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

struct StoredVector {
    values: Vec<f32>,
    norm: f32,
}

/// Brute-force in-memory dense index
pub struct InMemoryDenseIndex {
    dimension: usize,
    vectors: RwLock<BTreeMap<String, StoredVector>>,
}

impl InMemoryDenseIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: RwLock::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl DenseIndex for InMemoryDenseIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.vectors.read().len()
    }

    async fn upsert(&self, id: &str, vector: Vec<f32>) -> Result<(), RagError> {
        check_dimension(self.dimension, vector.len())?;
        let stored = StoredVector {
            norm: norm(&vector),
            values: vector,
        };
        self.vectors.write().insert(id.to_string(), stored);
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<DenseHit>, RagError> {
        check_dimension(self.dimension, vector.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_norm = norm(vector);
        let vectors = self.vectors.read();
        let mut hits: Vec<DenseHit> = vectors
            .iter()
            .map(|(id, stored)| {
                let score = if query_norm == 0.0 || stored.norm == 0.0 {
                    0.0
                } else {
                    let dot: f32 = stored.values.iter().zip(vector).map(|(a, b)| a * b).sum();
                    dot / (query_norm * stored.norm)
                };
                DenseHit {
                    id: id.clone(),
                    score,
                }
            })
            .collect();
        drop(vectors);

        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Qdrant connection settings
#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    pub endpoint: String,
    /// Collection for this snapshot
    pub collection: String,
    pub vector_dim: usize,
    pub api_key: Option<String>,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: endpoints::QDRANT_DEFAULT.to_string(),
            collection: "medirag".to_string(),
            vector_dim: medirag_config::constants::embedding::DIMENSION,
            api_key: None,
        }
    }
}

/// Qdrant-backed dense index
///
/// Qdrant point ids must be integers or UUIDs, so each document id is mapped
/// to a UUIDv5 and the original id travels in the payload.
pub struct QdrantDenseIndex {
    client: Qdrant,
    config: VectorStoreConfig,
    ids: RwLock<HashSet<String>>,
}

impl QdrantDenseIndex {
    /// Connect and create an empty collection
    ///
    /// A collection of the same name left by an earlier process is dropped
    /// first.
    pub async fn connect(config: VectorStoreConfig) -> Result<Self, RagError> {
        let mut builder = Qdrant::from_url(&config.endpoint);

        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
            tracing::info!("Qdrant connection using API key authentication");
        }

        let client = builder
            .build()
            .map_err(|e| RagError::Connection(e.to_string()))?;

        let index = Self {
            client,
            config,
            ids: RwLock::new(HashSet::new()),
        };
        index.reset_collection().await?;
        Ok(index)
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    async fn reset_collection(&self) -> Result<(), RagError> {
        let exists = self
            .client
            .collection_exists(&self.config.collection)
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        if exists {
            self.client
                .delete_collection(DeleteCollectionBuilder::new(&self.config.collection))
                .await
                .map_err(|e| RagError::VectorStore(e.to_string()))?;
            tracing::info!(collection = %self.config.collection, "Dropped stale Qdrant collection");
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.config.collection).vectors_config(
                    VectorParamsBuilder::new(self.config.vector_dim as u64, Distance::Cosine),
                ),
            )
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        tracing::info!(collection = %self.config.collection, "Created Qdrant collection");

        Ok(())
    }

    /// Deterministic point id for a document id
    pub fn point_id(doc_id: &str) -> String {
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, doc_id.as_bytes()).to_string()
    }
}

#[async_trait]
impl DenseIndex for QdrantDenseIndex {
    fn dimension(&self) -> usize {
        self.config.vector_dim
    }

    fn len(&self) -> usize {
        self.ids.read().len()
    }

    async fn upsert(&self, id: &str, vector: Vec<f32>) -> Result<(), RagError> {
        self.upsert_batch(vec![(id.to_string(), vector)]).await
    }

    async fn upsert_batch(&self, items: Vec<(String, Vec<f32>)>) -> Result<(), RagError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(items.len());
        let mut points = Vec::with_capacity(items.len());
        for (id, vector) in items {
            check_dimension(self.config.vector_dim, vector.len())?;
            let mut payload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
            payload.insert(DOC_ID_KEY.to_string(), id.clone().into());
            points.push(PointStruct::new(Self::point_id(&id), vector, payload));
            ids.push(id);
        }

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.config.collection, points).wait(true))
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        self.ids.write().extend(ids);
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<DenseHit>, RagError> {
        check_dimension(self.config.vector_dim, vector.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.config.collection, vector.to_vec(), k as u64)
                    .with_payload(true),
            )
            .await
            .map_err(|e| RagError::Search(e.to_string()))?;

        let mut hits: Vec<DenseHit> = response
            .result
            .into_iter()
            .filter_map(|point| {
                let id = point.payload.get(DOC_ID_KEY).and_then(|v| match &v.kind {
                    Some(Kind::StringValue(s)) => Some(s.clone()),
                    _ => None,
                })?;
                Some(DenseHit {
                    id,
                    score: point.score,
                })
            })
            .collect();

        sort_hits(&mut hits);
        Ok(hits)
    }

    async fn retire(&self) -> Result<(), RagError> {
        self.client
            .delete_collection(DeleteCollectionBuilder::new(&self.config.collection))
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;
        tracing::info!(collection = %self.config.collection, "Dropped retired Qdrant collection");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "qdrant"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_query_orders_by_similarity() {
        let index = InMemoryDenseIndex::new(2);
        index.upsert("A", vec![1.0, 0.0]).await.unwrap();
        index.upsert("B", vec![0.6, 0.8]).await.unwrap();
        index.upsert("C", vec![0.0, 1.0]).await.unwrap();

        let hits = index.query(&[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "A");
        assert_eq!(hits[1].id, "B");
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let index = InMemoryDenseIndex::new(2);
        index.upsert("A", vec![1.0, 0.0]).await.unwrap();
        index.upsert("A", vec![0.0, 1.0]).await.unwrap();
        assert_eq!(index.len(), 1);

        let hits = index.query(&[0.0, 1.0], 1).await.unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_ties_broken_by_id() {
        let index = InMemoryDenseIndex::new(2);
        index.upsert("b", vec![1.0, 0.0]).await.unwrap();
        index.upsert("a", vec![2.0, 0.0]).await.unwrap();
        let hits = index.query(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "b");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let index = InMemoryDenseIndex::new(3);
        assert!(matches!(
            index.upsert("A", vec![1.0, 0.0]).await,
            Err(RagError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert!(matches!(
            index.query(&[1.0], 5).await,
            Err(RagError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_point_id_is_stable_uuid() {
        let a = QdrantDenseIndex::point_id("D001");
        assert_eq!(a, QdrantDenseIndex::point_id("D001"));
        assert_ne!(a, QdrantDenseIndex::point_id("D002"));
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }
}
