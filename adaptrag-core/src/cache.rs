//! Semantic response cache.
//!
//! Answers are keyed by query embedding rather than query text: a lookup
//! hits when a cached query's embedding is at least `similarity_threshold`
//! cosine-similar to the incoming one. Entries live in a bounded LRU map
//! behind a single mutex, so concurrent turns may each miss and insert a
//! near-duplicate, but never corrupt the structure.

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::types::RetrievedDocument;
use crate::vector::cosine_similarity;

/// One cached answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticCacheEntry {
    pub id: Uuid,
    pub query_embedding: Vec<f32>,
    pub query: String,
    pub answer: String,
    /// Evidence the answer was generated from.
    pub context: Vec<RetrievedDocument>,
    pub created_at: DateTime<Utc>,
}

impl SemanticCacheEntry {
    pub fn new(
        query_embedding: Vec<f32>,
        query: impl Into<String>,
        answer: impl Into<String>,
        context: Vec<RetrievedDocument>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            query_embedding,
            query: query.into(),
            answer: answer.into(),
            context,
            created_at: Utc::now(),
        }
    }
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: SemanticCacheEntry,
    pub similarity: f32,
}

/// Cache effectiveness counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheMetrics {
    /// Compute the hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner {
    entries: LruCache<Uuid, SemanticCacheEntry>,
    metrics: CacheMetrics,
}

/// Bounded, internally synchronised semantic cache.
pub struct SemanticCache {
    inner: Mutex<Inner>,
    threshold: f32,
    ttl: Option<Duration>,
}

impl SemanticCache {
    pub fn new(capacity: usize, threshold: f32) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                metrics: CacheMetrics::default(),
            }),
            threshold,
            ttl: None,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let cache = Self::new(config.capacity, config.similarity_threshold);
        match config.ttl_secs {
            Some(secs) => cache.with_ttl(Duration::seconds(secs as i64)),
            None => cache,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &SemanticCacheEntry, now: DateTime<Utc>) -> bool {
        self.ttl.is_some_and(|ttl| now - entry.created_at > ttl)
    }

    /// Best entry at or above the similarity threshold. Expired entries are
    /// dropped as they are encountered.
    pub fn lookup(&self, query_embedding: &[f32]) -> Option<CacheHit> {
        let now = Utc::now();
        let mut inner = self.lock();

        let mut expired = Vec::new();
        let mut best: Option<(Uuid, f32)> = None;
        for (id, entry) in inner.entries.iter() {
            if self.is_expired(entry, now) {
                expired.push(*id);
                continue;
            }
            let similarity = cosine_similarity(query_embedding, &entry.query_embedding);
            if similarity >= self.threshold && best.is_none_or(|(_, s)| similarity > s) {
                best = Some((*id, similarity));
            }
        }

        for id in &expired {
            inner.entries.pop(id);
        }
        inner.metrics.expirations += expired.len() as u64;

        // `get` promotes the entry to most recently used
        let hit = best.and_then(|(id, similarity)| {
            inner.entries.get(&id).map(|entry| CacheHit {
                entry: entry.clone(),
                similarity,
            })
        });

        match &hit {
            Some(h) => {
                inner.metrics.hits += 1;
                debug!(similarity = h.similarity, cached_query = %h.entry.query, "Semantic cache hit");
            }
            None => inner.metrics.misses += 1,
        }
        hit
    }

    /// Insert an entry, evicting the least recently used one when full.
    pub fn insert(&self, entry: SemanticCacheEntry) -> Uuid {
        let id = entry.id;
        let mut inner = self.lock();
        if let Some((evicted, _)) = inner.entries.push(id, entry)
            && evicted != id
        {
            inner.metrics.evictions += 1;
        }
        inner.metrics.inserts += 1;
        id
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        self.lock().entries.pop(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.lock().metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(v: Vec<f32>, query: &str) -> SemanticCacheEntry {
        SemanticCacheEntry::new(v, query, format!("answer to {query}"), Vec::new())
    }

    #[test]
    fn test_exact_match_hits() {
        let cache = SemanticCache::new(4, 0.95);
        cache.insert(entry(vec![1.0, 0.0, 0.0], "what is rrf"));
        let hit = cache.lookup(&[1.0, 0.0, 0.0]).unwrap();
        assert_eq!(hit.entry.query, "what is rrf");
        assert!((hit.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_near_duplicate_hits_unrelated_misses() {
        let cache = SemanticCache::new(4, 0.95);
        cache.insert(entry(vec![1.0, 0.1, 0.0], "q"));
        assert!(cache.lookup(&[1.0, 0.12, 0.0]).is_some());
        assert!(cache.lookup(&[0.0, 0.0, 1.0]).is_none());
        let m = cache.metrics();
        assert_eq!(m.hits, 1);
        assert_eq!(m.misses, 1);
        assert!((m.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_best_match_wins() {
        let cache = SemanticCache::new(4, 0.5);
        cache.insert(entry(vec![1.0, 1.0], "diagonal"));
        cache.insert(entry(vec![1.0, 0.0], "axis"));
        let hit = cache.lookup(&[1.0, 0.05]).unwrap();
        assert_eq!(hit.entry.query, "axis");
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let cache = SemanticCache::new(2, 0.99);
        cache.insert(entry(vec![1.0, 0.0, 0.0], "a"));
        cache.insert(entry(vec![0.0, 1.0, 0.0], "b"));
        // touch "a" so "b" becomes the eviction candidate
        assert!(cache.lookup(&[1.0, 0.0, 0.0]).is_some());
        cache.insert(entry(vec![0.0, 0.0, 1.0], "c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&[1.0, 0.0, 0.0]).is_some());
        assert!(cache.lookup(&[0.0, 1.0, 0.0]).is_none());
        assert_eq!(cache.metrics().evictions, 1);
        assert_eq!(cache.metrics().inserts, 3);
    }

    #[test]
    fn test_ttl_expires_entries() {
        let cache = SemanticCache::new(4, 0.9).with_ttl(Duration::seconds(60));
        let mut old = entry(vec![1.0, 0.0], "old");
        old.created_at = Utc::now() - Duration::seconds(120);
        cache.insert(old);
        cache.insert(entry(vec![0.0, 1.0], "fresh"));

        assert!(cache.lookup(&[1.0, 0.0]).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.metrics().expirations, 1);
        assert!(cache.lookup(&[0.0, 1.0]).is_some());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = SemanticCache::new(0, 0.9);
        cache.insert(entry(vec![1.0], "a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = SemanticCache::from_config(&CacheConfig::default());
        let id = cache.insert(entry(vec![1.0], "a"));
        cache.insert(entry(vec![0.5], "b"));
        assert!(cache.remove(&id));
        assert!(!cache.remove(&id));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_and_lookups() {
        let cache = Arc::new(SemanticCache::new(64, 0.95));
        let mut handles = Vec::new();
        for i in 0..32 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                let v = vec![1.0, i as f32];
                if cache.lookup(&v).is_none() {
                    cache.insert(entry(v, &format!("q{i}")));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(cache.len() <= 32);
        assert!(!cache.is_empty());
        let m = cache.metrics();
        assert_eq!(m.hits + m.misses, 32);
        assert_eq!(m.inserts as usize, cache.len());
    }
}
