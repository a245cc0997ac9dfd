//! Second-pass reranking
//!
//! [`RerankStage`] sends the head of the fused list to a [`RerankProvider`]
//! and reorders it by the returned relevance. The stage never loses
//! candidates: anything the provider did not score keeps its fused order
//! after the scored ones, and any provider problem leaves the fused order
//! untouched.
//!
//! Providers:
//! - [`CohereReranker`] - Cohere `/v2/rerank` over HTTP
//! - [`LexicalOverlapReranker`] - local query-token coverage, no credentials

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use medirag_config::constants::{endpoints, reranker, timeouts};
use medirag_config::RerankerSettings;
use medirag_core::{
    document::truncate_chars, sort_by_rerank, Document, Error, RerankProvider, RerankScore,
    Result, ScoredCandidate,
};

use crate::tokenizer::Tokenizer;

/// Characters of the caution text included in rerank input
const CAUTION_PREVIEW_CHARS: usize = 200;

/// Text a reranker sees for a drug document
pub fn rerank_text(doc: &Document) -> String {
    let mut text = match doc.field("efficacy") {
        Some(efficacy) => format!("{}. 제품명: {}.", efficacy, doc.name),
        None => format!("제품명: {}.", doc.name),
    };
    if let Some(caution) = doc.field("caution_info") {
        text.push_str(" 적용: ");
        text.push_str(&truncate_chars(caution, CAUTION_PREVIEW_CHARS));
    }
    text
}

/// Rerank stage configuration
#[derive(Debug, Clone)]
pub struct RerankConfig {
    pub enabled: bool,
    /// Fused candidates sent to the provider
    pub top_n: usize,
    /// Skip when fewer candidates than this
    pub min_candidates: usize,
    pub timeout: Duration,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_n: reranker::TOP_N,
            min_candidates: reranker::MIN_CANDIDATES,
            timeout: Duration::from_millis(timeouts::RERANK_MS),
        }
    }
}

impl From<&RerankerSettings> for RerankConfig {
    fn from(settings: &RerankerSettings) -> Self {
        Self {
            enabled: settings.enabled,
            top_n: settings.top_n.max(1),
            min_candidates: settings.min_candidates,
            timeout: settings.timeout(),
        }
    }
}

/// What the stage did with a candidate list
#[derive(Debug, Clone, PartialEq)]
pub enum RerankStatus {
    Applied,
    Skipped(String),
    Failed(String),
}

impl RerankStatus {
    /// True when a provider problem forced a pass-through
    pub fn is_degraded(&self) -> bool {
        matches!(self, RerankStatus::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub candidates: Vec<ScoredCandidate>,
    pub status: RerankStatus,
}

/// Optional reranking stage
pub struct RerankStage {
    config: RerankConfig,
    provider: Option<Arc<dyn RerankProvider>>,
}

impl RerankStage {
    pub fn new(config: RerankConfig, provider: Option<Arc<dyn RerankProvider>>) -> Self {
        Self { config, provider }
    }

    /// Stage that always passes through
    pub fn disabled() -> Self {
        Self::new(
            RerankConfig {
                enabled: false,
                ..Default::default()
            },
            None,
        )
    }

    /// Enabled and backed by a provider
    pub fn is_active(&self) -> bool {
        self.config.enabled && self.provider.is_some()
    }

    /// Number of fused candidates the stage wants as input
    pub fn input_size(&self) -> usize {
        self.config.top_n
    }

    /// Whether `apply` would call the provider for `count` candidates
    pub fn should_apply(&self, count: usize) -> bool {
        self.is_active() && count >= self.config.min_candidates.max(1)
    }

    /// Rerank `candidates`, returning all of them
    pub async fn apply(&self, query: &str, candidates: Vec<ScoredCandidate>) -> RerankOutcome {
        let provider = match (&self.provider, self.config.enabled) {
            (Some(provider), true) => provider,
            (_, false) => return skipped(candidates, "disabled"),
            (None, true) => return skipped(candidates, "no provider"),
        };

        if candidates.len() < self.config.min_candidates.max(1) {
            return skipped(candidates, "too few candidates");
        }

        let mut head = candidates;
        let tail = head.split_off(head.len().min(self.config.top_n));
        let texts: Vec<String> = head.iter().map(|c| rerank_text(&c.document)).collect();

        let scores = match tokio::time::timeout(
            self.config.timeout,
            provider.rerank(query, &texts, head.len()),
        )
        .await
        {
            Ok(Ok(scores)) => scores,
            Ok(Err(err)) => {
                tracing::warn!(provider = provider.name(), error = %err, "Reranking failed");
                return failed(head, tail, err.to_string());
            },
            Err(_) => {
                tracing::warn!(
                    provider = provider.name(),
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Reranking timed out"
                );
                return failed(head, tail, "timeout".to_string());
            },
        };

        if let Err(reason) = validate_scores(&scores, head.len()) {
            tracing::warn!(provider = provider.name(), reason = %reason, "Invalid rerank response");
            return failed(head, tail, reason);
        }

        for score in &scores {
            head[score.index].rerank_score = Some(score.relevance_score);
        }
        sort_by_rerank(&mut head);

        tracing::debug!(
            provider = provider.name(),
            reranked = head.len(),
            scored = scores.len(),
            "Reranking applied"
        );

        head.extend(tail);
        RerankOutcome {
            candidates: head,
            status: RerankStatus::Applied,
        }
    }
}

fn skipped(candidates: Vec<ScoredCandidate>, reason: &str) -> RerankOutcome {
    RerankOutcome {
        candidates,
        status: RerankStatus::Skipped(reason.to_string()),
    }
}

fn failed(mut head: Vec<ScoredCandidate>, tail: Vec<ScoredCandidate>, reason: String) -> RerankOutcome {
    head.extend(tail);
    RerankOutcome {
        candidates: head,
        status: RerankStatus::Failed(reason),
    }
}

fn validate_scores(scores: &[RerankScore], len: usize) -> std::result::Result<(), String> {
    let mut seen = HashSet::new();
    for score in scores {
        if score.index >= len {
            return Err(format!("index {} out of range for {} documents", score.index, len));
        }
        if !seen.insert(score.index) {
            return Err(format!("duplicate index {}", score.index));
        }
        if !score.relevance_score.is_finite() {
            return Err(format!("non-finite score for index {}", score.index));
        }
    }
    Ok(())
}

/// Cohere reranker configuration
#[derive(Debug, Clone)]
pub struct CohereRerankerConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for CohereRerankerConfig {
    fn default() -> Self {
        Self {
            endpoint: endpoints::COHERE_DEFAULT.to_string(),
            api_key: String::new(),
            model: reranker::MODEL.to_string(),
            timeout: Duration::from_millis(timeouts::RERANK_MS),
        }
    }
}

#[derive(Debug, Serialize)]
struct CohereRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct CohereResponse {
    results: Vec<CohereResult>,
}

#[derive(Debug, Deserialize)]
struct CohereResult {
    index: usize,
    relevance_score: f32,
}

/// Cohere rerank API client
pub struct CohereReranker {
    client: Client,
    config: CohereRerankerConfig,
}

impl CohereReranker {
    pub fn new(config: CohereRerankerConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Configuration(
                "Cohere reranker requires an API key".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn rerank_url(&self) -> String {
        format!("{}/v2/rerank", self.config.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl RerankProvider for CohereReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankScore>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let body = CohereRequest {
            model: &self.config.model,
            query,
            documents,
            top_n: top_n.min(documents.len()),
        };

        let response = self
            .client
            .post(self.rerank_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider("cohere", format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::provider(
                "cohere",
                format!("Rerank failed: {} - {}", status, text),
            ));
        }

        let parsed: CohereResponse = response
            .json()
            .await
            .map_err(|e| Error::provider("cohere", format!("Failed to parse response: {}", e)))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|r| RerankScore {
                index: r.index,
                relevance_score: r.relevance_score,
            })
            .collect())
    }

    fn name(&self) -> &str {
        "cohere"
    }
}

/// Local reranker scoring query-token coverage
///
/// Score is the fraction of distinct query tokens present in the document.
#[derive(Debug, Clone, Default)]
pub struct LexicalOverlapReranker {
    tokenizer: Tokenizer,
}

impl LexicalOverlapReranker {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self { tokenizer }
    }

    pub fn score(&self, query: &str, document: &str) -> f32 {
        let query_tokens: HashSet<String> = self.tokenizer.tokenize(query).into_iter().collect();
        if query_tokens.is_empty() {
            return 0.0;
        }
        let doc_tokens: HashSet<String> = self.tokenizer.tokenize(document).into_iter().collect();

        let matched = query_tokens.iter().filter(|t| doc_tokens.contains(*t)).count();
        matched as f32 / query_tokens.len() as f32
    }
}

#[async_trait]
impl RerankProvider for LexicalOverlapReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankScore>> {
        let mut scores: Vec<RerankScore> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| RerankScore {
                index,
                relevance_score: self.score(query, doc),
            })
            .collect();

        scores.sort_by(|a, b| {
            b.relevance_score
                .total_cmp(&a.relevance_score)
                .then_with(|| a.index.cmp(&b.index))
        });
        scores.truncate(top_n);
        Ok(scores)
    }

    fn name(&self) -> &str {
        "lexical"
    }
}
