//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{embedding, endpoints, llm, memory, messages, rag, reranker, timeouts};
use crate::ConfigError;

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    /// Relaxed validation, offline providers allowed without credentials
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    /// Check if strict validation should be applied
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    /// Retrieval and fusion
    #[serde(default)]
    pub rag: RagConfig,

    #[serde(default)]
    pub embedding: EmbeddingSettings,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub reranker: RerankerSettings,

    /// Conversation memory and response cache
    #[serde(default)]
    pub memory: MemorySettings,

    /// Where the materialized catalog lives
    #[serde(default)]
    pub corpus: CorpusSettings,

    #[serde(default)]
    pub response: ResponseSettings,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_rag()?;
        self.validate_embedding()?;
        self.validate_llm()?;
        self.validate_reranker()?;
        self.validate_memory()?;
        Ok(())
    }

    fn validate_rag(&self) -> Result<(), ConfigError> {
        let rag = &self.rag;

        for (field, weight) in [
            ("rag.dense_weight", rag.dense_weight),
            ("rag.sparse_weight", rag.sparse_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: format!("Must be a finite non-negative number, got {}", weight),
                });
            }
        }

        if rag.dense_weight == 0.0 && rag.sparse_weight == 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "rag.dense_weight".to_string(),
                message: "Dense and sparse weights cannot both be zero".to_string(),
            });
        }

        if rag.candidate_multiplier == 0 {
            return Err(ConfigError::InvalidValue {
                field: "rag.candidate_multiplier".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        if rag.max_top_k == 0 || !(1..=rag.max_top_k).contains(&rag.default_top_k) {
            return Err(ConfigError::InvalidValue {
                field: "rag.default_top_k".to_string(),
                message: format!(
                    "Must be between 1 and rag.max_top_k ({}), got {}",
                    rag.max_top_k, rag.default_top_k
                ),
            });
        }

        if rag.ngram_width == 0 {
            return Err(ConfigError::InvalidValue {
                field: "rag.ngram_width".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&rag.bm25_b) {
            return Err(ConfigError::InvalidValue {
                field: "rag.bm25_b".to_string(),
                message: format!("Must be between 0.0 and 1.0, got {}", rag.bm25_b),
            });
        }

        if rag.bm25_k1 < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "rag.bm25_k1".to_string(),
                message: format!("Must be non-negative, got {}", rag.bm25_k1),
            });
        }

        if rag.max_query_chars == 0 {
            return Err(ConfigError::InvalidValue {
                field: "rag.max_query_chars".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    fn validate_embedding(&self) -> Result<(), ConfigError> {
        if self.embedding.dimension == 0 {
            return Err(ConfigError::InvalidValue {
                field: "embedding.dimension".to_string(),
                message: "Must be greater than zero".to_string(),
            });
        }

        if self.environment.is_strict()
            && self.embedding.provider == EmbeddingProviderKind::OpenAI
            && self.embedding.api_key.is_none()
        {
            return Err(ConfigError::MissingField("embedding.api_key".to_string()));
        }

        Ok(())
    }

    fn validate_llm(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::InvalidValue {
                field: "llm.temperature".to_string(),
                message: format!("Must be between 0.0 and 2.0, got {}", self.llm.temperature),
            });
        }

        if self.environment.is_strict()
            && self.llm.provider == LlmProviderKind::OpenAI
            && self.llm.api_key.is_none()
        {
            return Err(ConfigError::MissingField("llm.api_key".to_string()));
        }

        Ok(())
    }

    fn validate_reranker(&self) -> Result<(), ConfigError> {
        let rr = &self.reranker;

        if rr.top_n == 0 || rr.min_candidates == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reranker.top_n".to_string(),
                message: "top_n and min_candidates must be at least 1".to_string(),
            });
        }

        if self.environment.is_strict()
            && rr.enabled
            && rr.provider == RerankerProviderKind::Cohere
            && rr.api_key.is_none()
        {
            return Err(ConfigError::MissingField("reranker.api_key".to_string()));
        }

        Ok(())
    }

    fn validate_memory(&self) -> Result<(), ConfigError> {
        if self.memory.context_window > self.memory.max_history {
            return Err(ConfigError::InvalidValue {
                field: "memory.context_window".to_string(),
                message: format!(
                    "Cannot exceed memory.max_history ({}), got {}",
                    self.memory.max_history, self.memory.context_window
                ),
            });
        }

        Ok(())
    }
}

/// Which dense/lexical technology stack serves queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process BM25 and brute-force cosine scan
    #[default]
    Memory,
    /// Tantivy lexical index and Qdrant dense collection
    Qdrant,
}

/// Retrieval and fusion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Weight of the normalized dense score
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f32,

    /// Weight of the normalized sparse score
    #[serde(default = "default_sparse_weight")]
    pub sparse_weight: f32,

    /// Each channel fetches `candidate_multiplier * K` candidates
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,

    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,

    #[serde(default = "default_disease_top_k")]
    pub disease_top_k: usize,

    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,

    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f32,

    #[serde(default = "default_bm25_b")]
    pub bm25_b: f32,

    #[serde(default = "default_ngram_width")]
    pub ngram_width: usize,

    /// Expand colloquial symptom phrases in queries
    #[serde(default = "default_true")]
    pub query_expansion: bool,

    #[serde(default = "default_dense_timeout_ms")]
    pub dense_timeout_ms: u64,

    #[serde(default = "default_sparse_timeout_ms")]
    pub sparse_timeout_ms: u64,

    #[serde(default = "default_qdrant_endpoint")]
    pub qdrant_endpoint: String,

    /// Prefix of the per-snapshot Qdrant collections
    #[serde(default = "default_qdrant_collection")]
    pub qdrant_collection: String,

    #[serde(default)]
    pub qdrant_api_key: Option<String>,

    /// Directory for the on-disk tantivy index (RAM if unset)
    #[serde(default)]
    pub tantivy_index_path: Option<String>,
}

fn default_dense_weight() -> f32 {
    rag::DENSE_WEIGHT
}
fn default_sparse_weight() -> f32 {
    rag::SPARSE_WEIGHT
}
fn default_candidate_multiplier() -> usize {
    rag::CANDIDATE_MULTIPLIER
}
fn default_top_k() -> usize {
    rag::DEFAULT_TOP_K
}
fn default_max_top_k() -> usize {
    rag::MAX_TOP_K
}
fn default_disease_top_k() -> usize {
    rag::DISEASE_TOP_K
}
fn default_max_query_chars() -> usize {
    rag::MAX_QUERY_CHARS
}
fn default_bm25_k1() -> f32 {
    rag::BM25_K1
}
fn default_bm25_b() -> f32 {
    rag::BM25_B
}
fn default_ngram_width() -> usize {
    rag::NGRAM_WIDTH
}
fn default_true() -> bool {
    true
}
fn default_dense_timeout_ms() -> u64 {
    timeouts::DENSE_MS
}
fn default_sparse_timeout_ms() -> u64 {
    timeouts::SPARSE_MS
}
fn default_qdrant_endpoint() -> String {
    endpoints::QDRANT_DEFAULT.to_string()
}
fn default_qdrant_collection() -> String {
    "medirag".to_string()
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            dense_weight: default_dense_weight(),
            sparse_weight: default_sparse_weight(),
            candidate_multiplier: default_candidate_multiplier(),
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            disease_top_k: default_disease_top_k(),
            max_query_chars: default_max_query_chars(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            ngram_width: default_ngram_width(),
            query_expansion: true,
            dense_timeout_ms: default_dense_timeout_ms(),
            sparse_timeout_ms: default_sparse_timeout_ms(),
            qdrant_endpoint: default_qdrant_endpoint(),
            qdrant_collection: default_qdrant_collection(),
            qdrant_api_key: None,
            tantivy_index_path: None,
        }
    }
}

impl RagConfig {
    pub fn dense_timeout(&self) -> Duration {
        Duration::from_millis(self.dense_timeout_ms)
    }

    pub fn sparse_timeout(&self) -> Duration {
        Duration::from_millis(self.sparse_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    #[default]
    #[serde(rename = "openai")]
    OpenAI,
    Ollama,
    /// Deterministic offline embedder
    Hash,
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default)]
    pub provider: EmbeddingProviderKind,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Defaults to the provider's public endpoint
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_embedding_model() -> String {
    embedding::MODEL.to_string()
}
fn default_embedding_dimension() -> usize {
    embedding::DIMENSION
}
fn default_embedding_batch_size() -> usize {
    embedding::BATCH_SIZE
}
fn default_embedding_timeout_ms() -> u64 {
    timeouts::EMBEDDING_MS
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::default(),
            model: default_embedding_model(),
            endpoint: None,
            api_key: None,
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            timeout_ms: default_embedding_timeout_ms(),
        }
    }
}

impl EmbeddingSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    #[default]
    #[serde(rename = "openai")]
    OpenAI,
    Ollama,
}

/// Generation backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub provider: LlmProviderKind,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,

    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
}

fn default_llm_model() -> String {
    llm::MODEL.to_string()
}
fn default_llm_max_tokens() -> u32 {
    llm::MAX_TOKENS
}
fn default_llm_temperature() -> f32 {
    llm::TEMPERATURE
}
fn default_llm_timeout_ms() -> u64 {
    timeouts::LLM_MS
}
fn default_llm_max_retries() -> u32 {
    llm::MAX_RETRIES
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::default(),
            model: default_llm_model(),
            endpoint: None,
            api_key: None,
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
            timeout_ms: default_llm_timeout_ms(),
            max_retries: default_llm_max_retries(),
        }
    }
}

impl LlmSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RerankerProviderKind {
    #[default]
    Cohere,
    /// Local keyword-overlap scorer
    Lexical,
}

/// Reranking stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub provider: RerankerProviderKind,

    #[serde(default = "default_reranker_model")]
    pub model: String,

    #[serde(default = "default_cohere_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Fused candidates sent for reranking
    #[serde(default = "default_reranker_top_n")]
    pub top_n: usize,

    #[serde(default = "default_reranker_min_candidates")]
    pub min_candidates: usize,

    #[serde(default = "default_reranker_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_reranker_model() -> String {
    reranker::MODEL.to_string()
}
fn default_cohere_endpoint() -> String {
    endpoints::COHERE_DEFAULT.to_string()
}
fn default_reranker_top_n() -> usize {
    reranker::TOP_N
}
fn default_reranker_min_candidates() -> usize {
    reranker::MIN_CANDIDATES
}
fn default_reranker_timeout_ms() -> u64 {
    timeouts::RERANK_MS
}

impl Default for RerankerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: RerankerProviderKind::default(),
            model: default_reranker_model(),
            endpoint: default_cohere_endpoint(),
            api_key: None,
            top_n: default_reranker_top_n(),
            min_candidates: default_reranker_min_candidates(),
            timeout_ms: default_reranker_timeout_ms(),
        }
    }
}

impl RerankerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Conversation memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Prior turns given to the generator
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    #[serde(default = "default_response_preview_chars")]
    pub response_preview_chars: usize,

    #[serde(default = "default_history_ttl_secs")]
    pub history_ttl_secs: u64,

    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Timeout for each memory store read or write
    #[serde(default = "default_memory_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_history() -> usize {
    memory::MAX_HISTORY
}
fn default_context_window() -> usize {
    memory::CONTEXT_WINDOW
}
fn default_response_preview_chars() -> usize {
    memory::RESPONSE_PREVIEW_CHARS
}
fn default_history_ttl_secs() -> u64 {
    memory::HISTORY_TTL_SECS
}
fn default_cache_ttl_secs() -> u64 {
    memory::CACHE_TTL_SECS
}
fn default_memory_timeout_ms() -> u64 {
    timeouts::MEMORY_MS
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_history: default_max_history(),
            context_window: default_context_window(),
            response_preview_chars: default_response_preview_chars(),
            history_ttl_secs: default_history_ttl_secs(),
            cache_enabled: true,
            cache_ttl_secs: default_cache_ttl_secs(),
            timeout_ms: default_memory_timeout_ms(),
        }
    }
}

impl MemorySettings {
    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Materialized catalog locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusSettings {
    /// Drug records: a JSON/YAML file or a directory of them
    #[serde(default = "default_drugs_path")]
    pub drugs_path: String,

    /// Disease records, optional
    #[serde(default)]
    pub diseases_path: Option<String>,
}

fn default_drugs_path() -> String {
    "data/drugs.json".to_string()
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            drugs_path: default_drugs_path(),
            diseases_path: Some("data/diseases.json".to_string()),
        }
    }
}

/// Fixed response text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSettings {
    #[serde(default = "default_disclaimer")]
    pub disclaimer: String,

    /// Attach the disclaimer even when no narrative was produced
    #[serde(default = "default_true")]
    pub always_disclaim: bool,

    /// Narrative used when retrieval found nothing
    #[serde(default = "default_no_results_message")]
    pub no_results_message: String,
}

fn default_disclaimer() -> String {
    messages::DISCLAIMER.to_string()
}
fn default_no_results_message() -> String {
    messages::NO_RESULTS.to_string()
}

impl Default for ResponseSettings {
    fn default() -> Self {
        Self {
            disclaimer: default_disclaimer(),
            always_disclaim: true,
            no_results_message: default_no_results_message(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub metrics_enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: false,
            metrics_port: default_metrics_port(),
        }
    }
}

/// Load settings from files and environment
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    load_settings_from("config", env)
}

/// Load settings with an explicit config directory
pub fn load_settings_from(config_dir: &str, env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name(&format!("{}/default", config_dir)).required(false));

    if let Some(env_name) = env {
        builder = builder
            .add_source(File::with_name(&format!("{}/{}", config_dir, env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("MEDIRAG")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}
