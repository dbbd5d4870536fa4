//! Error types for the adaptrag engine.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering model providers, the vector store, retrieval, configuration,
//! context management and the workflow executor.

use std::path::PathBuf;

use crate::types::NodeExecution;

/// Top-level error type for the adaptrag core library.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Vector store error: {0}")]
    Store(#[from] StoreError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// A fatal error stopped the turn. The trace collected so far is kept so
    /// callers can still see which steps ran.
    #[error("Turn aborted at node '{node}': {source}")]
    TurnAborted {
        node: String,
        #[source]
        source: Box<RagError>,
        trace: Vec<NodeExecution>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RagError {
    /// Whether this error cannot be recovered by a fallback and must end the turn.
    pub fn is_fatal(&self) -> bool {
        match self {
            RagError::Provider(e) => e.is_fatal(),
            RagError::Store(e) => e.is_fatal(),
            RagError::Retrieval(e) => e.is_fatal(),
            RagError::Config(_) => true,
            RagError::TurnAborted { .. } => true,
            RagError::Context(_)
            | RagError::Workflow(_)
            | RagError::Io(_)
            | RagError::Serialization(_) => false,
        }
    }

    /// The trace attached to an aborted turn, if any.
    pub fn trace(&self) -> Option<&[NodeExecution]> {
        match self {
            RagError::TurnAborted { trace, .. } => Some(trace),
            _ => None,
        }
    }
}

/// Errors from embedding and completion providers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Invalid provider configuration: {message}")]
    InvalidConfig { message: String },

    /// No model is configured at all. Turns degrade to the fallback answer.
    #[error("No completion model available: {message}")]
    Unavailable { message: String },
}

impl ProviderError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProviderError::AuthFailed { .. } | ProviderError::InvalidConfig { .. }
        )
    }

    /// Transient errors worth retrying at the provider boundary.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Streaming { .. }
                | ProviderError::Connection { .. }
                | ProviderError::Timeout { .. }
        )
    }
}

/// Errors from the vector store collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Search failed: {message}")]
    Search { message: String },

    #[error("Insert failed: {message}")]
    Insert { message: String },

    #[error("Vector store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Vector dimension mismatch: store expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. } | StoreError::DimensionMismatch { .. }
        )
    }
}

/// Errors from the hybrid retrieval pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetrievalError {
    #[error("Query embedding failed: {0}")]
    Embedding(#[from] ProviderError),

    #[error("Vector store failed: {0}")]
    Store(#[from] StoreError),

    #[error(
        "No embedding model matches the store dimension {store_dimension} (configured model '{model}' produces {embedder_dimension})"
    )]
    DimensionMismatch {
        model: String,
        store_dimension: usize,
        embedder_dimension: usize,
    },
}

impl RetrievalError {
    pub fn is_fatal(&self) -> bool {
        match self {
            RetrievalError::Embedding(e) => e.is_fatal(),
            RetrievalError::Store(e) => e.is_fatal(),
            RetrievalError::DimensionMismatch { .. } => true,
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the context window manager and session persistence.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Context compression failed: {message}")]
    CompressionFailed { message: String },

    #[error("Session persistence error: {message}")]
    PersistenceError { message: String },

    #[error("Failed to load session: {message}")]
    SessionLoadFailed { message: String },
}

/// Errors from the workflow executor.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Step budget of {max} node visits exhausted")]
    StepBudgetExceeded { max: usize },

    #[error("Node not registered: {node}")]
    NodeNotFound { node: String },

    #[error("Node '{node}' has no outgoing edge")]
    MissingEdge { node: String },
}

/// A type alias for results using the top-level `RagError`.
pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_provider() {
        let err = RagError::Provider(ProviderError::ApiRequest {
            message: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "Provider error: API request failed: connection refused"
        );
    }

    #[test]
    fn test_error_display_store() {
        let err = RagError::Store(StoreError::DimensionMismatch {
            expected: 768,
            actual: 1536,
        });
        assert_eq!(
            err.to_string(),
            "Vector store error: Vector dimension mismatch: store expects 768, got 1536"
        );
    }

    #[test]
    fn test_error_display_config() {
        let err = RagError::Config(ConfigError::MissingField {
            field: "llm.api_key".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing required field: llm.api_key"
        );
    }

    #[test]
    fn test_error_display_workflow() {
        let err = RagError::Workflow(WorkflowError::StepBudgetExceeded { max: 25 });
        assert_eq!(
            err.to_string(),
            "Workflow error: Step budget of 25 node visits exhausted"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(
            RagError::Provider(ProviderError::AuthFailed {
                provider: "openai".into()
            })
            .is_fatal()
        );
        assert!(
            !RagError::Provider(ProviderError::Timeout { timeout_secs: 30 }).is_fatal()
        );
        assert!(
            !RagError::Store(StoreError::Search {
                message: "index busy".into()
            })
            .is_fatal()
        );
        assert!(
            RagError::Store(StoreError::Unavailable {
                message: "connection refused".into()
            })
            .is_fatal()
        );
        assert!(
            RagError::Retrieval(RetrievalError::DimensionMismatch {
                model: "m".into(),
                store_dimension: 768,
                embedder_dimension: 384,
            })
            .is_fatal()
        );
    }

    #[test]
    fn test_retrieval_error_inherits_fatality() {
        let err: RetrievalError = ProviderError::InvalidConfig {
            message: "bad base url".into(),
        }
        .into();
        assert!(err.is_fatal());
        let err: RetrievalError = StoreError::Search {
            message: "oops".into(),
        }
        .into();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ProviderError::RateLimited { retry_after_secs: 3 }.is_retryable());
        assert!(
            ProviderError::Connection {
                message: "reset".into()
            }
            .is_retryable()
        );
        assert!(
            !ProviderError::ResponseParse {
                message: "bad json".into()
            }
            .is_retryable()
        );
        let unavailable = ProviderError::Unavailable {
            message: "no api key".into(),
        };
        assert!(!unavailable.is_retryable());
        assert!(!unavailable.is_fatal());
    }

    #[test]
    fn test_turn_aborted_keeps_trace() {
        let err = RagError::TurnAborted {
            node: "fan_out_join".into(),
            source: Box::new(RagError::Provider(ProviderError::AuthFailed {
                provider: "openai".into(),
            })),
            trace: Vec::new(),
        };
        assert!(err.is_fatal());
        assert!(err.trace().is_some());
        assert!(err.to_string().contains("fan_out_join"));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: RagError = serde_err.into();
        assert!(matches!(err, RagError::Serialization(_)));
    }
}
