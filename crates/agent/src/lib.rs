//! Recommendation orchestration
//!
//! Features:
//! - Staged pipeline with an explicit transition table
//! - Per-stage degradation instead of request failure
//! - Grounded narrative synthesis with session history
//! - Session memory and response cache keyed by session
//! - Cooperative cancellation

pub mod memory;
pub mod orchestrator;
pub mod request;
pub mod stage;
pub mod synthesizer;

pub use memory::{cache_key, InMemoryResponseCache, InMemorySessionStore};
pub use orchestrator::{OrchestratorConfig, RagOrchestrator};
pub use request::{Degradation, RecommendationRequest, RecommendationResult, StageTimings};
pub use stage::{PipelineStage, StageTrace, StageTransition};
pub use synthesizer::{ResponseSynthesizer, SynthesisConfig};

pub use tokio_util::sync::CancellationToken;
