//! Core type definitions for the adaptrag engine.
//!
//! Defines the data model shared by every component: conversation messages,
//! retrieved documents, grades, orchestrator decisions, the per-turn execution
//! trace, and the request/response shapes of the public engine API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::tokens::estimate_tokens;

/// Represents a participant role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in a conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
    /// Set on the synthetic digest produced by context compression.
    #[serde(default)]
    pub is_summary: bool,
}

impl ConversationMessage {
    /// Create a new message with auto-generated ID, timestamp and token estimate.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4(),
            role,
            token_count: estimate_tokens(&content),
            content,
            timestamp: Utc::now(),
            is_summary: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create the synthetic system-role digest that replaces compressed history.
    pub fn summary(content: impl Into<String>) -> Self {
        let mut msg = Self::system(content);
        msg.is_summary = true;
        msg
    }
}

/// Which retrieval leg produced a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentSource {
    Dense,
    Sparse,
    Hybrid,
}

/// A document produced by the retrieval and fusion stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub score: f32,
    pub source: DocumentSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

/// Metadata key under which the dense leg keeps the raw store similarity.
pub const SIMILARITY_KEY: &str = "similarity";

impl RetrievedDocument {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        score: f32,
        source: DocumentSource,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: HashMap::new(),
            score,
            source,
            rerank_score: None,
        }
    }

    /// Raw vector similarity if the dense leg recorded one, otherwise `score`.
    pub fn similarity(&self) -> f32 {
        self.metadata
            .get(SIMILARITY_KEY)
            .and_then(|v| v.as_f64())
            .map(|v| v as f32)
            .unwrap_or(self.score)
    }

    /// Score used for final ordering: the rerank score when present.
    pub fn effective_score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.score)
    }
}

/// Relevance of a single document within a grade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentGrade {
    pub document_id: String,
    pub score: f32,
}

/// Pass/fail relevance judgment for one retrieval attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalGrade {
    pub is_relevant: bool,
    pub score: f32,
    pub reasoning: String,
    #[serde(default)]
    pub per_document_grades: Vec<DocumentGrade>,
}

impl RetrievalGrade {
    /// The grade given to an empty evidence set.
    pub fn empty() -> Self {
        Self {
            is_relevant: false,
            score: 0.0,
            reasoning: "No documents were retrieved".to_string(),
            per_document_grades: Vec::new(),
        }
    }
}

/// What the orchestrator decided to do with a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Retrieval was requested.
    ToolCall,
    /// Answer directly without evidence.
    Generate,
    /// Ask the user a clarifying question.
    Clarify,
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionKind::ToolCall => write!(f, "tool_call"),
            DecisionKind::Generate => write!(f, "generate"),
            DecisionKind::Clarify => write!(f, "clarify"),
        }
    }
}

/// Outcome of intent analysis; drives the first conditional branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorDecision {
    pub kind: DecisionKind,
    pub intent: String,
    pub confidence: f32,
    pub needs_retrieval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_query: Option<String>,
}

impl OrchestratorDecision {
    /// Used whenever analysis fails: assume the query needs evidence.
    pub fn default_retrieve(query: &str) -> Self {
        Self {
            kind: DecisionKind::ToolCall,
            intent: "unknown".to_string(),
            confidence: 0.0,
            needs_retrieval: true,
            search_query: Some(query.to_string()),
        }
    }

    pub fn small_talk() -> Self {
        Self {
            kind: DecisionKind::Generate,
            intent: "small_talk".to_string(),
            confidence: 1.0,
            needs_retrieval: false,
            search_query: None,
        }
    }
}

/// Lifecycle of a trace step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Error,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Pending => write!(f, "pending"),
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Completed => write!(f, "completed"),
            NodeStatus::Skipped => write!(f, "skipped"),
            NodeStatus::Error => write!(f, "error"),
        }
    }
}

/// Append-only audit record for one node (or parallel sub-task) of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub name: String,
    pub status: NodeStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeExecution {
    /// Open a running record stamped with the current time.
    pub fn start(name: impl Into<String>, input: Option<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            status: NodeStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            input,
            output: None,
            error: None,
        }
    }

    /// A record for a node bypassed by a conditional edge.
    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            status: NodeStatus::Skipped,
            start_time: now,
            end_time: Some(now),
            input: None,
            output: Some(serde_json::json!({ "reason": reason.into() })),
            error: None,
        }
    }

    pub fn complete(mut self, output: Option<serde_json::Value>) -> Self {
        self.status = NodeStatus::Completed;
        self.end_time = Some(Utc::now());
        self.output = output;
        self
    }

    pub fn fail(mut self, error: impl std::fmt::Display) -> Self {
        self.status = NodeStatus::Error;
        self.end_time = Some(Utc::now());
        self.error = Some(error.to_string());
        self
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

/// Per-request options for a single turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    pub top_k: usize,
    pub similarity_threshold: f32,
    /// Accepted as configured, but a turn never rewrites more than once.
    pub max_retries: u32,
    pub grade_pass_threshold: f32,
    /// Skip the cache lookup (the fresh answer may still be cached).
    #[serde(default)]
    pub skip_semantic_cache: bool,
    /// Do not write the answer of this turn to the semantic cache.
    #[serde(default)]
    pub skip_cache_write: bool,
    #[serde(default)]
    pub enable_sparse: bool,
    #[serde(default)]
    pub enable_rerank: bool,
    /// Trimmed conversation history supplied to analysis and generation.
    #[serde(default)]
    pub history: Vec<ConversationMessage>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_threshold: 0.0,
            max_retries: 1,
            grade_pass_threshold: 0.5,
            skip_semantic_cache: false,
            skip_cache_write: false,
            enable_sparse: true,
            enable_rerank: false,
            history: Vec::new(),
        }
    }
}

impl QueryOptions {
    /// Derive per-request defaults from the engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            similarity_threshold: config.retrieval.similarity_threshold,
            max_retries: config.grading.max_retries,
            grade_pass_threshold: config.grading.pass_threshold,
            enable_sparse: config.retrieval.enable_sparse,
            enable_rerank: config.retrieval.enable_rerank,
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationMessage>) -> Self {
        self.history = history;
        self
    }
}

/// Structured result of one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    pub query: String,
    pub processed_query: String,
    pub trace: Vec<NodeExecution>,
    pub retrieved_docs: Vec<RetrievedDocument>,
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<OrchestratorDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<RetrievalGrade>,
    pub rewrite_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl QueryResult {
    /// Number of trace steps with the given name and status.
    pub fn count_steps(&self, name: &str, status: NodeStatus) -> usize {
        self.trace
            .iter()
            .filter(|s| s.name == name && s.status == status)
            .count()
    }
}

/// Events emitted by the streaming engine API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    /// One finished trace step.
    Workflow(NodeExecution),
    /// Incremental answer text.
    Token(String),
    /// The full structured result; always the last event of a successful turn.
    Done(Box<QueryResult>),
    Error(String),
}

/// Emitted by post-hoc verification when a delivered answer should be amended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionEvent {
    pub query: String,
    pub original_answer: String,
    pub corrected_answer: String,
    pub confidence: f32,
    pub unsupported_claims: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(Role::System.to_string(), "system");
    }

    #[test]
    fn test_message_token_count_is_estimated() {
        let msg = ConversationMessage::user("How does the retry controller work?");
        assert!(msg.token_count > 0);
        assert!(!msg.is_summary);
        assert!(ConversationMessage::summary("digest").is_summary);
    }

    #[test]
    fn test_document_similarity_prefers_metadata() {
        let mut doc = RetrievedDocument::new("d1", "text", 0.01, DocumentSource::Hybrid);
        assert!((doc.similarity() - 0.01).abs() < f32::EPSILON);
        doc.metadata
            .insert(SIMILARITY_KEY.to_string(), serde_json::json!(0.82));
        assert!((doc.similarity() - 0.82).abs() < 1e-6);
    }

    #[test]
    fn test_effective_score_uses_rerank() {
        let mut doc = RetrievedDocument::new("d1", "text", 0.4, DocumentSource::Dense);
        assert!((doc.effective_score() - 0.4).abs() < f32::EPSILON);
        doc.rerank_score = Some(0.9);
        assert!((doc.effective_score() - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_node_execution_lifecycle() {
        let step = NodeExecution::start("generate", None);
        assert_eq!(step.status, NodeStatus::Running);
        let done = step.complete(Some(serde_json::json!({"chars": 12})));
        assert_eq!(done.status, NodeStatus::Completed);
        assert!(done.end_time.is_some());
        assert!(done.duration_ms().unwrap() >= 0);

        let failed = NodeExecution::start("retrieve", None).fail("store offline");
        assert_eq!(failed.status, NodeStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("store offline"));
    }

    #[test]
    fn test_engine_event_wire_shape() {
        let event = EngineEvent::Token("Hel".into());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["data"], "Hel");

        let step = NodeExecution::skipped("grade_retrieval", "retrieval not needed");
        let json = serde_json::to_value(EngineEvent::Workflow(step)).unwrap();
        assert_eq!(json["type"], "workflow");
        assert_eq!(json["data"]["status"], "skipped");
    }

    #[test]
    fn test_decision_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&DecisionKind::ToolCall).unwrap(),
            "\"tool_call\""
        );
        let d = OrchestratorDecision::default_retrieve("what is rrf");
        assert!(d.needs_retrieval);
        assert_eq!(d.search_query.as_deref(), Some("what is rrf"));
        assert!(!OrchestratorDecision::small_talk().needs_retrieval);
    }

    #[test]
    fn test_query_options_defaults() {
        let opts = QueryOptions::default();
        assert_eq!(opts.top_k, 5);
        assert_eq!(opts.max_retries, 1);
        assert!((opts.grade_pass_threshold - 0.5).abs() < f32::EPSILON);
        assert!(!opts.skip_semantic_cache);
    }

    #[test]
    fn test_query_options_from_config() {
        let mut config = EngineConfig::default();
        config.retrieval.top_k = 8;
        config.grading.max_retries = 3;
        let opts = QueryOptions::from_config(&config);
        assert_eq!(opts.top_k, 8);
        assert_eq!(opts.max_retries, 3);
    }
}
