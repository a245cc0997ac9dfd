//! Lexical index backed by Tantivy
//!
//! Documents are run through the same [`Tokenizer`] as the in-memory BM25
//! index and the resulting tokens are stored whitespace-joined in a field
//! analyzed by a whitespace tokenizer. Queries are an OR of term queries over
//! the same token stream, so both backends see identical terms and differ
//! only in where postings live.

use std::path::Path;
use std::sync::Arc;

use tantivy::{
    collector::TopDocs,
    directory::MmapDirectory,
    query::{BooleanQuery, Occur, Query, TermQuery},
    schema::{
        Field, IndexRecordOption, OwnedValue, Schema, TextFieldIndexing, TextOptions, STORED,
        STRING,
    },
    tokenizer::{TextAnalyzer, WhitespaceTokenizer},
    Index, IndexReader, TantivyDocument, Term,
};

use medirag_core::Document;

use crate::sparse_search::{LexicalIndex, SparseHit};
use crate::tokenizer::{QueryExpander, Tokenizer};
use crate::RagError;

const TOKEN_ANALYZER: &str = "medirag_tokens";

/// Writer heap size
const WRITER_HEAP_BYTES: usize = 50_000_000;

pub struct TantivyLexicalIndex {
    reader: IndexReader,
    id_field: Field,
    tokens_field: Field,
    tokenizer: Tokenizer,
    expander: Option<QueryExpander>,
    doc_count: usize,
}

impl TantivyLexicalIndex {
    /// Build an index over the full corpus
    ///
    /// With `index_path` the index is written to that directory. An index left
    /// there by an earlier run is reopened and emptied before writing, so the
    /// result always holds exactly `documents`. Otherwise it lives in RAM.
    pub fn build(
        documents: &[Arc<Document>],
        tokenizer: Tokenizer,
        index_path: Option<&Path>,
    ) -> Result<Self, RagError> {
        let mut schema_builder = Schema::builder();

        let token_options = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(TOKEN_ANALYZER)
                .set_index_option(IndexRecordOption::WithFreqs),
        );

        let id_field = schema_builder.add_text_field("id", STRING | STORED);
        let tokens_field = schema_builder.add_text_field("tokens", token_options);
        let schema = schema_builder.build();

        let index = match index_path {
            Some(path) => {
                std::fs::create_dir_all(path)
                    .map_err(|e| RagError::Index(format!("Failed to create index dir: {}", e)))?;
                let dir = MmapDirectory::open(path).map_err(|e| RagError::Index(e.to_string()))?;
                Index::open_or_create(dir, schema).map_err(|e| RagError::Index(e.to_string()))?
            },
            None => Index::create_in_ram(schema),
        };

        index.tokenizers().register(
            TOKEN_ANALYZER,
            TextAnalyzer::builder(WhitespaceTokenizer::default()).build(),
        );

        let mut writer = index
            .writer(WRITER_HEAP_BYTES)
            .map_err(|e| RagError::Index(e.to_string()))?;
        writer
            .delete_all_documents()
            .map_err(|e| RagError::Index(e.to_string()))?;

        for doc in documents {
            let tokens = tokenizer.tokenize(&doc.retrieval_text());
            let mut tantivy_doc = TantivyDocument::default();
            tantivy_doc.add_text(id_field, &doc.id);
            tantivy_doc.add_text(tokens_field, tokens.join(" "));
            writer
                .add_document(tantivy_doc)
                .map_err(|e| RagError::Index(e.to_string()))?;
        }

        writer
            .commit()
            .map_err(|e| RagError::Index(e.to_string()))?;

        let reader = index.reader().map_err(|e| RagError::Index(e.to_string()))?;
        reader
            .reload()
            .map_err(|e| RagError::Index(e.to_string()))?;

        tracing::info!(
            documents = documents.len(),
            on_disk = index_path.is_some(),
            "Tantivy lexical index built"
        );

        Ok(Self {
            reader,
            id_field,
            tokens_field,
            tokenizer,
            expander: None,
            doc_count: documents.len(),
        })
    }

    /// Expand queries with a symptom lexicon before searching
    pub fn with_query_expansion(mut self, expander: QueryExpander) -> Self {
        self.expander = Some(expander);
        self
    }

    fn query_tokens(&self, query: &str) -> Vec<String> {
        let mut tokens = self.tokenizer.tokenize(query);
        if let Some(ref expander) = self.expander {
            let words = self.tokenizer.words(query);
            for term in expander.expand(&words) {
                tokens.extend(self.tokenizer.tokenize(&term));
            }
        }
        tokens
    }
}

impl LexicalIndex for TantivyLexicalIndex {
    fn search(&self, query: &str, k: usize) -> Result<Vec<SparseHit>, RagError> {
        let tokens = self.query_tokens(query);
        if k == 0 || tokens.is_empty() || self.doc_count == 0 {
            return Ok(Vec::new());
        }

        let clauses: Vec<(Occur, Box<dyn Query>)> = tokens
            .iter()
            .map(|token| {
                let term = Term::from_field_text(self.tokens_field, token);
                let query: Box<dyn Query> =
                    Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
                (Occur::Should, query)
            })
            .collect();
        let query = BooleanQuery::new(clauses);

        let searcher = self.reader.searcher();

        // Widen the collector until nothing tied with the k-th score is left
        // out, so the id tie-break decides the boundary
        let mut limit = k.min(self.doc_count);
        let top_docs = loop {
            let top_docs = searcher
                .search(&query, &TopDocs::with_limit(limit))
                .map_err(|e| RagError::Search(e.to_string()))?;

            let boundary_tied = top_docs.len() == limit
                && top_docs.get(k - 1).map(|(score, _)| *score)
                    == top_docs.last().map(|(score, _)| *score);
            if !boundary_tied || limit >= self.doc_count {
                break top_docs;
            }
            limit = limit.saturating_mul(2).min(self.doc_count);
        };

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| RagError::Search(e.to_string()))?;

            let id = match doc.get_first(self.id_field) {
                Some(OwnedValue::Str(s)) => s.clone(),
                _ => continue,
            };
            if score > 0.0 {
                hits.push(SparseHit { id, score });
            }
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.doc_count
    }

    fn name(&self) -> &'static str {
        "tantivy"
    }
}
