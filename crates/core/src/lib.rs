//! Core traits and types for the drug recommendation pipeline
//!
//! This crate provides foundational types used across all other crates:
//! - Documents and the records they are built from
//! - Scored candidates produced per query
//! - Conversation turns kept by session memory
//! - Provider traits (embedding, generation, reranking, memory, cache)
//! - Error types

pub mod candidate;
pub mod conversation;
pub mod document;
pub mod error;
pub mod llm_types;
pub mod traits;

pub use candidate::{sort_by_fused, sort_by_rerank, MatchChannel, ScoredCandidate};
pub use conversation::{query_hash, ConversationTurn, SourceRef};
pub use document::{DiseaseRecord, Document, DocumentKind, DrugRecord, TextField};
pub use error::{Error, Result};
pub use llm_types::{FinishReason, GenerateRequest, GenerateResponse, Message, Role, TokenUsage};

pub use traits::{
    CachedResponse, EmbeddingProvider, LanguageModel, RerankProvider, RerankScore, ResponseCache,
    SessionMemoryStore,
};
