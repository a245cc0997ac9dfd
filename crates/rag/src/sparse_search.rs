//! Sparse search using in-memory BM25
//!
//! Postings, document lengths and the average length are corpus-global, so
//! the index is built once from the whole corpus and never mutated. A rebuild
//! produces a new index.

use std::collections::HashMap;
use std::sync::Arc;

use medirag_config::constants::rag;
use medirag_core::Document;

use crate::tokenizer::{QueryExpander, Tokenizer};
use crate::RagError;

/// Sparse search hit with its raw (unnormalized) score
#[derive(Debug, Clone, PartialEq)]
pub struct SparseHit {
    pub id: String,
    pub score: f32,
}

/// Lexical scoring contract shared by the BM25 and tantivy backends
///
/// Searches are synchronous and CPU-bound; callers run them on the blocking
/// pool.
pub trait LexicalIndex: Send + Sync + 'static {
    /// Top `k` documents with a positive score, descending, ties by id
    fn search(&self, query: &str, k: usize) -> Result<Vec<SparseHit>, RagError>;

    /// Number of indexed documents
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn name(&self) -> &'static str;
}

/// BM25 parameters
#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    /// Term frequency saturation
    pub k1: f32,
    /// Length normalization
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: rag::BM25_K1,
            b: rag::BM25_B,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Posting {
    doc: u32,
    tf: u32,
}

/// In-memory BM25 index
pub struct Bm25Index {
    tokenizer: Tokenizer,
    expander: Option<QueryExpander>,
    params: Bm25Params,
    doc_ids: Vec<String>,
    doc_lens: Vec<u32>,
    avg_len: f32,
    postings: HashMap<String, Vec<Posting>>,
}

impl Bm25Index {
    /// Build from the full corpus
    ///
    /// An empty corpus yields an empty index.
    pub fn build(documents: &[Arc<Document>], tokenizer: Tokenizer, params: Bm25Params) -> Self {
        let mut doc_ids = Vec::with_capacity(documents.len());
        let mut doc_lens = Vec::with_capacity(documents.len());
        let mut postings: HashMap<String, Vec<Posting>> = HashMap::new();

        for (idx, doc) in documents.iter().enumerate() {
            let tokens = tokenizer.tokenize(&doc.retrieval_text());
            doc_lens.push(tokens.len() as u32);
            doc_ids.push(doc.id.clone());

            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for (token, count) in tf {
                postings.entry(token).or_default().push(Posting {
                    doc: idx as u32,
                    tf: count,
                });
            }
        }

        let total: u64 = doc_lens.iter().map(|&l| l as u64).sum();
        let avg_len = if doc_lens.is_empty() {
            0.0
        } else {
            total as f32 / doc_lens.len() as f32
        };

        tracing::debug!(
            documents = doc_ids.len(),
            terms = postings.len(),
            avg_len,
            "Built BM25 index"
        );

        Self {
            tokenizer,
            expander: None,
            params,
            doc_ids,
            doc_lens,
            avg_len,
            postings,
        }
    }

    /// Expand queries with a symptom lexicon before scoring
    pub fn with_query_expansion(mut self, expander: QueryExpander) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    /// Query tokens, including expansion terms when configured
    pub fn query_tokens(&self, query: &str) -> Vec<String> {
        let mut tokens = self.tokenizer.tokenize(query);
        if let Some(ref expander) = self.expander {
            let words = self.tokenizer.words(query);
            for term in expander.expand(&words) {
                tokens.extend(self.tokenizer.tokenize(&term));
            }
        }
        tokens
    }

    /// Lucene-style IDF, strictly positive for any indexed token
    fn idf(&self, df: usize) -> f32 {
        let n = self.doc_ids.len() as f32;
        let df = df as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn term_weight(&self, tf: u32, doc_len: u32) -> f32 {
        let Bm25Params { k1, b } = self.params;
        let tf = tf as f32;
        let len_ratio = if self.avg_len > 0.0 {
            doc_len as f32 / self.avg_len
        } else {
            0.0
        };
        tf * (k1 + 1.0) / (tf + k1 * (1.0 - b + b * len_ratio))
    }

    /// Raw scores for every document matching at least one token
    fn accumulate(&self, tokens: &[String]) -> HashMap<u32, f32> {
        let mut scores: HashMap<u32, f32> = HashMap::new();
        for token in tokens {
            let Some(postings) = self.postings.get(token) else {
                continue;
            };
            let idf = self.idf(postings.len());
            for posting in postings {
                let len = self.doc_lens[posting.doc as usize];
                *scores.entry(posting.doc).or_insert(0.0) += idf * self.term_weight(posting.tf, len);
            }
        }
        scores
    }

    /// Score one document against a tokenized query
    ///
    /// Unknown documents and tokens absent from the corpus score zero.
    pub fn score(&self, query_tokens: &[String], doc_id: &str) -> f32 {
        let Some(idx) = self.doc_ids.iter().position(|id| id == doc_id) else {
            return 0.0;
        };
        self.accumulate(query_tokens)
            .get(&(idx as u32))
            .copied()
            .unwrap_or(0.0)
    }
}

impl LexicalIndex for Bm25Index {
    fn search(&self, query: &str, k: usize) -> Result<Vec<SparseHit>, RagError> {
        if k == 0 || self.doc_ids.is_empty() {
            return Ok(Vec::new());
        }

        let tokens = self.query_tokens(query);
        let mut hits: Vec<SparseHit> = self
            .accumulate(&tokens)
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .map(|(doc, score)| SparseHit {
                id: self.doc_ids[doc as usize].clone(),
                score,
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.doc_ids.len()
    }

    fn name(&self) -> &'static str {
        "bm25"
    }
}
