//! Conversation turns kept in session memory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Document cited by a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    pub name: String,
    pub score: f32,
}

/// One (query, response) exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub response: String,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(query: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            response: response.into(),
            sources: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<SourceRef>) -> Self {
        self.sources = sources;
        self
    }
}

/// Stable hash of a query for cache keys
///
/// Case and surrounding whitespace do not change the hash. Returns the first
/// 16 hex characters of the SHA-256 digest.
pub fn query_hash(query: &str) -> String {
    let normalized = query.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_hash_normalizes() {
        assert_eq!(query_hash("  Headache "), query_hash("headache"));
        assert_ne!(query_hash("두통"), query_hash("복통"));
        assert_eq!(query_hash("두통").len(), 16);
    }

    #[test]
    fn test_turn_builder() {
        let turn = ConversationTurn::new("두통", "타이레놀을 고려해 보세요").with_sources(vec![
            SourceRef {
                id: "D001".into(),
                name: "타이레놀정".into(),
                score: 0.8,
            },
        ]);
        assert_eq!(turn.sources.len(), 1);
    }
}
