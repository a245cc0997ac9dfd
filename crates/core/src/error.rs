//! Error taxonomy shared by every crate in the workspace

use thiserror::Error;

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline error
///
/// Configuration errors are fatal and never retried. Provider, timeout and
/// index errors are local to one stage and are normally absorbed by degrading
/// that stage. Validation errors are the caller's fault.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Index error: {0}")]
    Index(String),
}

impl Error {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Whether the failing stage may be degraded instead of failing the request
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Provider { .. } | Self::Timeout { .. } | Self::Index(_)
        )
    }

    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Provider { .. } => "provider",
            Self::Validation(_) => "validation",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Index(_) => "index",
        }
    }
}
