//! Provider traits
//!
//! Every external collaborator of the pipeline sits behind one of these
//! traits. Providers are constructed once at process start and injected into
//! the orchestrator as `Arc<dyn Trait>`.

mod embedding;
mod llm;
mod memory;
mod rerank;

pub use embedding::EmbeddingProvider;
pub use llm::LanguageModel;
pub use memory::{CachedResponse, ResponseCache, SessionMemoryStore};
pub use rerank::{RerankProvider, RerankScore};
