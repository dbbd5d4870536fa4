//! # AdaptRAG Core
//!
//! Adaptive retrieval-augmented generation engine.
//! Provides the orchestration graph, hybrid dense + BM25 retrieval with
//! reciprocal rank fusion, relevance grading with a bounded query rewrite,
//! a semantic answer cache, conversation window management and post-hoc
//! answer verification.

pub mod cache;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod grading;
pub mod intent;
pub mod llm_json;
pub mod provider;
pub mod providers;
pub mod retrieval;
pub mod session;
pub mod store;
pub mod types;
pub mod vector;
pub mod verification;
pub mod workflow;

// Re-export commonly used types at the crate root.
pub use cache::{CacheMetrics, SemanticCache, SemanticCacheEntry};
pub use config::{ContextStrategy, EngineConfig, load_config};
pub use context::{ContextWindowManager, estimate_tokens};
pub use conversation::ConversationManager;
pub use error::{
    ConfigError, ContextError, ProviderError, RagError, Result, RetrievalError, StoreError,
    WorkflowError,
};
pub use provider::{
    CompletionProvider, EmbeddingProvider, LocalEmbeddingProvider, MockCompletionProvider,
    UnavailableCompletionProvider,
};
pub use retrieval::{HybridRetriever, Reranker};
pub use session::{InMemorySessionStore, JsonFileSessionStore, Session, SessionStore};
pub use store::{InMemoryVectorStore, VectorRecord, VectorStore};
pub use types::{
    ConversationMessage, CorrectionEvent, DecisionKind, DocumentSource, EngineEvent,
    NodeExecution, NodeStatus, OrchestratorDecision, QueryOptions, QueryResult, RetrievalGrade,
    RetrievedDocument, Role,
};
pub use workflow::{RagEngine, RagEngineBuilder};
