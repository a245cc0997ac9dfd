//! In-process session memory and response cache
//!
//! Both stores are keyed by session so that concurrent sessions never
//! contend on a shared lock. Expired entries are dropped lazily on access,
//! and writes sweep the whole map at most once per sweep interval so that
//! sessions which never return do not accumulate.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use medirag_config::constants::memory;
use medirag_config::MemorySettings;
use medirag_core::{query_hash, CachedResponse, ConversationTurn, ResponseCache, Result, SessionMemoryStore};

/// Cache key for a query within a session
///
/// The result shape depends on `top_k` and `include_diseases`, so both are
/// part of the key.
pub fn cache_key(session_id: &str, query: &str, top_k: usize, include_diseases: bool) -> String {
    format!(
        "{}:{}:{}:{}",
        session_id,
        query_hash(query),
        top_k,
        u8::from(include_diseases)
    )
}

/// Rate limiter for full-map sweeps
struct SweepClock {
    interval: Duration,
    last: Mutex<Instant>,
}

impl SweepClock {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(Instant::now()),
        }
    }

    /// True at most once per interval
    fn due(&self) -> bool {
        let mut last = self.last.lock();
        if last.elapsed() < self.interval {
            return false;
        }
        *last = Instant::now();
        true
    }
}

struct Session {
    turns: VecDeque<ConversationTurn>,
    last_access: Instant,
}

/// Session history held in memory
pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
    max_history: usize,
    ttl: Duration,
    sweep: SweepClock,
}

impl InMemorySessionStore {
    pub fn new(max_history: usize, ttl: Duration) -> Self {
        let interval = ttl.min(Duration::from_secs(memory::SWEEP_INTERVAL_SECS));
        Self {
            sessions: DashMap::new(),
            max_history: max_history.max(1),
            ttl,
            sweep: SweepClock::new(interval),
        }
    }

    pub fn from_settings(settings: &MemorySettings) -> Self {
        Self::new(settings.max_history, settings.history_ttl())
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop every expired session, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.last_access.elapsed() <= self.ttl);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::debug!(removed, "Purged expired sessions");
        }
        removed
    }

    fn drop_if_expired(&self, session_id: &str) {
        self.sessions
            .remove_if(session_id, |_, session| session.last_access.elapsed() > self.ttl);
    }
}

#[async_trait]
impl SessionMemoryStore for InMemorySessionStore {
    async fn get(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        self.drop_if_expired(session_id);

        Ok(self
            .sessions
            .get(session_id)
            .map(|session| {
                let skip = session.turns.len().saturating_sub(limit);
                session.turns.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn append(&self, session_id: &str, turn: ConversationTurn) -> Result<usize> {
        if self.sweep.due() {
            self.purge_expired();
        } else {
            self.drop_if_expired(session_id);
        }

        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session {
                turns: VecDeque::new(),
                last_access: Instant::now(),
            });

        session.turns.push_back(turn);
        while session.turns.len() > self.max_history {
            session.turns.pop_front();
        }
        session.last_access = Instant::now();

        tracing::debug!(session_id, turns = session.turns.len(), "Stored conversation turn");
        Ok(session.turns.len())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn turn_count(&self, session_id: &str) -> Result<usize> {
        self.drop_if_expired(session_id);
        Ok(self
            .sessions
            .get(session_id)
            .map(|s| s.turns.len())
            .unwrap_or(0))
    }
}

/// Response cache held in memory
pub struct InMemoryResponseCache {
    entries: DashMap<String, (CachedResponse, Instant)>,
    sweep: SweepClock,
}

impl Default for InMemoryResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResponseCache {
    pub fn new() -> Self {
        Self::with_sweep_interval(Duration::from_secs(memory::SWEEP_INTERVAL_SECS))
    }

    pub fn with_sweep_interval(interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            sweep: SweepClock::new(interval),
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires)| *expires > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "Purged expired cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        Ok(self.entries.get(key).map(|entry| entry.0.clone()))
    }

    async fn put(&self, key: &str, value: CachedResponse, ttl: Duration) -> Result<()> {
        if self.sweep.due() {
            self.purge_expired();
        }
        if ttl.is_zero() {
            return Ok(());
        }
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn turn(i: usize) -> ConversationTurn {
        ConversationTurn::new(format!("q{}", i), format!("a{}", i))
    }

    #[tokio::test]
    async fn test_append_returns_count_and_bounds_history() {
        let store = InMemorySessionStore::new(3, Duration::from_secs(60));
        for i in 1..=5 {
            let count = store.append("s1", turn(i)).await.unwrap();
            assert_eq!(count, i.min(3));
        }

        let turns = store.get("s1", 10).await.unwrap();
        let queries: Vec<_> = turns.iter().map(|t| t.query.as_str()).collect();
        assert_eq!(queries, vec!["q3", "q4", "q5"]);
    }

    #[tokio::test]
    async fn test_get_returns_most_recent_oldest_first() {
        let store = InMemorySessionStore::new(20, Duration::from_secs(60));
        for i in 1..=4 {
            store.append("s1", turn(i)).await.unwrap();
        }
        let turns = store.get("s1", 2).await.unwrap();
        assert_eq!(turns[0].query, "q3");
        assert_eq!(turns[1].query, "q4");
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = InMemorySessionStore::new(20, Duration::from_secs(60));
        store.append("a", turn(1)).await.unwrap();
        store.append("b", turn(2)).await.unwrap();
        store.clear("a").await.unwrap();

        assert_eq!(store.turn_count("a").await.unwrap(), 0);
        assert_eq!(store.turn_count("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_session_expires() {
        let store = InMemorySessionStore::new(20, Duration::from_millis(20));
        store.append("s1", turn(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.get("s1", 5).await.unwrap().is_empty());
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_sessions_are_swept_on_write() {
        let store = InMemorySessionStore::new(20, Duration::from_millis(20));
        for i in 0..10 {
            store.append(&format!("gone-{}", i), turn(i)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(40)).await;
        store.append("active", turn(1)).await.unwrap();

        assert_eq!(store.session_count(), 1);
        assert_eq!(store.turn_count("active").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cache_put_get_and_expiry() {
        let cache = InMemoryResponseCache::new();
        let value = CachedResponse {
            narrative: Some("답변".to_string()),
            candidates: Vec::new(),
            diseases: Vec::new(),
            cached_at: Utc::now(),
        };
        let key = cache_key("s1", "두통", 5, true);

        cache.put(&key, value.clone(), Duration::from_secs(60)).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_some());
        assert!(cache.get(&cache_key("s2", "두통", 5, true)).await.unwrap().is_none());

        cache.put(&key, value, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&key).await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_unread_cache_entries_are_swept_on_put() {
        let cache = InMemoryResponseCache::with_sweep_interval(Duration::ZERO);
        let value = CachedResponse {
            narrative: None,
            candidates: Vec::new(),
            diseases: Vec::new(),
            cached_at: Utc::now(),
        };

        for i in 0..10 {
            let key = cache_key(&format!("s{}", i), "두통", 5, true);
            cache.put(&key, value.clone(), Duration::from_millis(10)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        let live = cache_key("live", "두통", 5, true);
        cache.put(&live, value, Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&live).await.unwrap().is_some());
    }

    #[test]
    fn test_cache_key_normalizes_query() {
        assert_eq!(cache_key("s", " 두통 ", 5, true), cache_key("s", "두통", 5, true));
        assert_ne!(cache_key("s", "두통", 5, true), cache_key("t", "두통", 5, true));
    }

    #[test]
    fn test_cache_key_separates_result_shape() {
        let base = cache_key("s", "두통", 5, true);
        assert_ne!(base, cache_key("s", "두통", 1, true));
        assert_ne!(base, cache_key("s", "두통", 5, false));
    }
}
