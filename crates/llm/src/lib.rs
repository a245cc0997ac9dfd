//! LLM integration for recommendation narratives
//!
//! Features:
//! - OpenAI-compatible chat completions backend
//! - Ollama chat backend
//! - Retry with exponential backoff on transient failures
//! - Grounding prompts built from fused candidates and session history

pub mod backend;
pub mod factory;
pub mod prompt;

pub use backend::{OllamaBackend, OllamaConfig, OpenAIBackend, OpenAIConfig};
pub use factory::create_language_model;
pub use prompt::{format_context, format_history, PromptBuilder};

use thiserror::Error;

/// LLM errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Network(err.to_string())
    }
}

impl From<LlmError> for medirag_core::Error {
    fn from(err: LlmError) -> Self {
        use medirag_core::Error;

        match err {
            LlmError::Configuration(msg) => Error::Configuration(msg),
            LlmError::Timeout(timeout_ms) => Error::Timeout {
                operation: "generation".to_string(),
                timeout_ms,
            },
            other => Error::provider("llm", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: medirag_core::Error = LlmError::Api("HTTP 400".into()).into();
        assert!(matches!(err, medirag_core::Error::Provider { .. }));

        let err: medirag_core::Error = LlmError::Timeout(60_000).into();
        assert!(matches!(
            err,
            medirag_core::Error::Timeout {
                timeout_ms: 60_000,
                ..
            }
        ));

        let err: medirag_core::Error = LlmError::Configuration("no key".into()).into();
        assert!(!err.is_recoverable());
    }
}
