//! Dense + lexical retrieval with fusion and optional rerank.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::fusion::{RrfConfig, reciprocal_rank_fusion};
use super::lexical::{Bm25Index, Bm25Params};
use super::rerank::Reranker;
use crate::config::RetrievalConfig;
use crate::error::RetrievalError;
use crate::provider::EmbeddingProvider;
use crate::store::{SearchHit, VectorStore};
use crate::types::{DocumentSource, QueryOptions, RetrievedDocument, SIMILARITY_KEY};

/// Per-call retrieval knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub enable_sparse: bool,
    pub enable_rerank: bool,
}

impl From<&QueryOptions> for RetrievalRequest {
    fn from(options: &QueryOptions) -> Self {
        Self {
            top_k: options.top_k,
            similarity_threshold: options.similarity_threshold,
            enable_sparse: options.enable_sparse,
            enable_rerank: options.enable_rerank,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalStatus {
    Completed,
    /// The store returned no candidates.
    Skipped,
}

/// Result of one retrieval pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    pub documents: Vec<RetrievedDocument>,
    pub status: RetrievalStatus,
    pub dense_count: usize,
    pub sparse_count: usize,
    pub reranked: bool,
    pub embedding_model: String,
}

impl RetrievalOutcome {
    fn empty(embedding_model: String) -> Self {
        Self {
            documents: Vec::new(),
            status: RetrievalStatus::Skipped,
            dense_count: 0,
            sparse_count: 0,
            reranked: false,
            embedding_model,
        }
    }

    /// Compact summary for trace records.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status,
            "documents": self.documents.len(),
            "dense_candidates": self.dense_count,
            "sparse_matches": self.sparse_count,
            "reranked": self.reranked,
            "embedding_model": self.embedding_model,
        })
    }
}

/// Hybrid retriever over an injected vector store.
///
/// Holds the primary embedder plus alternates. The store dimension is probed
/// once; the first embedder producing vectors of that length is used for
/// every later query.
pub struct HybridRetriever {
    store: Arc<dyn VectorStore>,
    embedders: Vec<Arc<dyn EmbeddingProvider>>,
    reranker: Option<Arc<dyn Reranker>>,
    config: RetrievalConfig,
    selected: OnceCell<usize>,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedders: vec![embedder],
            reranker: None,
            config,
            selected: OnceCell::new(),
        }
    }

    /// Add an embedder tried when the primary does not match the store.
    pub fn with_alternate_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedders.push(embedder);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    fn rrf_config(&self) -> RrfConfig {
        RrfConfig {
            k: self.config.rrf_k,
            dense_weight: self.config.dense_weight,
            sparse_weight: self.config.sparse_weight,
        }
    }

    fn bm25_params(&self) -> Bm25Params {
        Bm25Params {
            k1: self.config.bm25_k1,
            b: self.config.bm25_b,
        }
    }

    async fn probe_embedder(&self) -> Result<usize, RetrievalError> {
        let stats = self.store.stats().await?;
        let store_dim = stats.vector_dimension;
        let primary = &self.embedders[0];
        match self
            .embedders
            .iter()
            .position(|e| e.dimension() == store_dim)
        {
            Some(0) => Ok(0),
            Some(i) => {
                warn!(
                    configured = primary.model_name(),
                    configured_dimension = primary.dimension(),
                    selected = self.embedders[i].model_name(),
                    store_dimension = store_dim,
                    "Embedding model does not match store dimension, using alternate"
                );
                Ok(i)
            }
            None => Err(RetrievalError::DimensionMismatch {
                model: primary.model_name().to_string(),
                store_dimension: store_dim,
                embedder_dimension: primary.dimension(),
            }),
        }
    }

    /// The embedder whose dimension matches the store, probing on first use.
    pub async fn query_embedder(&self) -> Result<Arc<dyn EmbeddingProvider>, RetrievalError> {
        let index = self
            .selected
            .get_or_try_init(|| self.probe_embedder())
            .await?;
        Ok(Arc::clone(&self.embedders[*index]))
    }

    /// Embed `query` with the store-matching model and search.
    pub async fn dense_search(
        &self,
        query: &str,
        fetch_k: usize,
        threshold: f32,
    ) -> Result<(Vec<RetrievedDocument>, String), RetrievalError> {
        let embedder = self.query_embedder().await?;
        let vector = embedder.embed(query).await?;
        if vector.len() != embedder.dimension() {
            return Err(RetrievalError::DimensionMismatch {
                model: embedder.model_name().to_string(),
                store_dimension: embedder.dimension(),
                embedder_dimension: vector.len(),
            });
        }
        let hits = self.store.search(&vector, fetch_k, threshold).await?;
        let docs = hits.into_iter().map(dense_document).collect();
        Ok((docs, embedder.model_name().to_string()))
    }

    /// Run the full hybrid pipeline for one query.
    pub async fn retrieve(
        &self,
        query: &str,
        request: &RetrievalRequest,
    ) -> Result<RetrievalOutcome, RetrievalError> {
        let top_k = request.top_k.max(1);
        let fetch_k = if request.enable_sparse {
            top_k * self.config.candidate_multiplier.max(1)
        } else {
            top_k
        };

        let (dense, model) = self
            .dense_search(query, fetch_k, request.similarity_threshold)
            .await?;
        if dense.is_empty() {
            debug!(query, "No dense candidates, retrieval skipped");
            return Ok(RetrievalOutcome::empty(model));
        }

        let sparse = if request.enable_sparse {
            let index = Bm25Index::build(dense.iter().map(|d| d.content.as_str()), self.bm25_params());
            index
                .rank(query)
                .into_iter()
                .map(|hit| {
                    let mut doc = dense[hit.index].clone();
                    doc.score = hit.score;
                    doc.source = DocumentSource::Sparse;
                    doc
                })
                .collect()
        } else {
            Vec::new()
        };

        let dense_count = dense.len();
        let sparse_count = sparse.len();
        let mut documents = reciprocal_rank_fusion(&dense, &sparse, &self.rrf_config(), top_k);

        let mut reranked = false;
        if request.enable_rerank
            && let Some(reranker) = &self.reranker
        {
            documents = reranker
                .rerank(query, documents, self.config.rerank_top_k.max(1))
                .await;
            reranked = true;
        }

        info!(
            query,
            dense = dense_count,
            sparse = sparse_count,
            returned = documents.len(),
            reranked,
            "Hybrid retrieval complete"
        );

        Ok(RetrievalOutcome {
            documents,
            status: RetrievalStatus::Completed,
            dense_count,
            sparse_count,
            reranked,
            embedding_model: model,
        })
    }
}

fn dense_document(hit: SearchHit) -> RetrievedDocument {
    let mut doc = RetrievedDocument::new(hit.id, hit.content, hit.score, DocumentSource::Dense);
    doc.metadata = hit.metadata;
    doc.metadata
        .insert(SIMILARITY_KEY.to_string(), serde_json::json!(hit.score));
    doc
}
