//! Hybrid retrieval: dense vector search, BM25 over the dense candidates,
//! reciprocal rank fusion and optional judge-model rerank.

pub mod fusion;
pub mod hybrid;
pub mod lexical;
pub mod rerank;

pub use fusion::{RrfConfig, reciprocal_rank_fusion};
pub use hybrid::{HybridRetriever, RetrievalOutcome, RetrievalRequest, RetrievalStatus};
pub use lexical::{Bm25Index, Bm25Params, tokenize};
pub use rerank::{LlmReranker, Reranker};
