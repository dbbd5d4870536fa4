//! Vector store abstraction and an in-memory reference implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::StoreError;
use crate::vector::SimilarityMetric;

/// One nearest-neighbour result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub score: f32,
}

/// Store-level facts the engine needs before embedding a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub vector_dimension: usize,
    pub document_count: usize,
    pub metric: SimilarityMetric,
}

/// A record to insert into a vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Nearest-neighbour search over stored document vectors.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Top-`top_k` records whose score is at least `threshold`, best first.
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Vector store held entirely in memory behind a read/write lock.
pub struct InMemoryVectorStore {
    dimension: usize,
    metric: SimilarityMetric,
    records: RwLock<Vec<VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self::with_metric(dimension, SimilarityMetric::Cosine)
    }

    pub fn with_metric(dimension: usize, metric: SimilarityMetric) -> Self {
        Self {
            dimension,
            metric,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Insert or replace a record by id.
    pub fn insert(&self, record: VectorRecord) -> Result<(), StoreError> {
        if record.vector.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: record.vector.len(),
            });
        }
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|r| r.id != id);
        records.len() != before
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>, StoreError> {
        if vector.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut hits: Vec<SearchHit> = records
            .iter()
            .map(|r| (r, self.metric.score(vector, &r.vector)))
            .filter(|(_, score)| *score >= threshold)
            .map(|(r, score)| SearchHit {
                id: r.id.clone(),
                content: r.content.clone(),
                metadata: r.metadata.clone(),
                score,
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            vector_dimension: self.dimension,
            document_count: self.len(),
            metric: self.metric,
        })
    }
}

/// A store whose `search` always fails. `stats` still answers so the
/// dimension probe succeeds and the failure surfaces at search time.
pub struct FailingVectorStore {
    dimension: usize,
    error: StoreError,
}

impl FailingVectorStore {
    pub fn new(dimension: usize, error: StoreError) -> Self {
        Self { dimension, error }
    }
}

#[async_trait]
impl VectorStore for FailingVectorStore {
    async fn search(
        &self,
        _vector: &[f32],
        _top_k: usize,
        _threshold: f32,
    ) -> Result<Vec<SearchHit>, StoreError> {
        Err(self.error.clone())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            vector_dimension: self.dimension,
            document_count: 0,
            metric: SimilarityMetric::Cosine,
        })
    }
}
