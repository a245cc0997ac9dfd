//! Session memory and response cache traits

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ConversationTurn, Result, ScoredCandidate};

/// Per-session conversation history
///
/// Sessions are independent; implementations key all state by session id.
#[async_trait]
pub trait SessionMemoryStore: Send + Sync + 'static {
    /// Most recent `limit` turns, oldest first
    async fn get(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>>;

    /// Append a turn and return the session's turn count
    async fn append(&self, session_id: &str, turn: ConversationTurn) -> Result<usize>;

    async fn clear(&self, session_id: &str) -> Result<()>;

    async fn turn_count(&self, session_id: &str) -> Result<usize>;
}

/// Response stored for a repeated query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub narrative: Option<String>,
    pub candidates: Vec<ScoredCandidate>,
    #[serde(default)]
    pub diseases: Vec<ScoredCandidate>,
    pub cached_at: DateTime<Utc>,
}

/// Response-level cache keyed by an opaque string
#[async_trait]
pub trait ResponseCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>>;

    async fn put(&self, key: &str, value: CachedResponse, ttl: Duration) -> Result<()>;
}
