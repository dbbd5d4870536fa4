//! Turn state and the partial updates nodes return.
//!
//! Nodes never mutate [`AgentState`] directly. Each returns a [`StatePatch`];
//! the graph applies it with one rule: trace records append, every other set
//! field overwrites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{
    NodeExecution, OrchestratorDecision, QueryOptions, QueryResult, RetrievalGrade,
    RetrievedDocument,
};

/// Trace name of the cache lookup performed before the graph runs.
pub const CACHE_CHECK: &str = "cache_check";
/// Trace name of the intent sub-task of `fan_out_join`.
pub const ANALYZE_INTENT: &str = "analyze_intent";
/// Trace name of the first-pass retrieval sub-task of `fan_out_join`.
pub const RETRIEVE: &str = "retrieve";
/// Trace name used for executor-level failures.
pub const GRAPH: &str = "graph";

/// Nodes of the orchestration graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    FanOutJoin,
    GradeRetrieval,
    RewriteQuery,
    RetrieveAfterRewrite,
    Generate,
    Finalize,
}

impl NodeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeId::FanOutJoin => "fan_out_join",
            NodeId::GradeRetrieval => "grade_retrieval",
            NodeId::RewriteQuery => "rewrite_query",
            NodeId::RetrieveAfterRewrite => "retrieve_after_rewrite",
            NodeId::Generate => "generate",
            NodeId::Finalize => "finalize",
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about a turn while the graph runs.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub query: String,
    /// The query retrieval currently uses; differs from `query` after a rewrite.
    pub processed_query: String,
    pub options: QueryOptions,
    pub decision: Option<OrchestratorDecision>,
    pub documents: Vec<RetrievedDocument>,
    pub grade: Option<RetrievalGrade>,
    /// Rewrites triggered so far.
    pub retry_count: u32,
    /// Set when a rewrite was refused; no further rewrite is attempted.
    pub rewrite_rejected: bool,
    pub answer: Option<String>,
    /// Whether `answer` came from a successful generation.
    pub generated: bool,
    pub trace: Vec<NodeExecution>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentState {
    pub fn new(query: impl Into<String>, options: QueryOptions) -> Self {
        let query = query.into();
        Self {
            processed_query: query.clone(),
            query,
            options,
            decision: None,
            documents: Vec::new(),
            grade: None,
            retry_count: 0,
            rewrite_rejected: false,
            answer: None,
            generated: false,
            trace: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Merge a node's partial update.
    pub fn apply(&mut self, patch: StatePatch) {
        self.trace.extend(patch.trace);
        if let Some(q) = patch.processed_query {
            self.processed_query = q;
        }
        if let Some(d) = patch.decision {
            self.decision = Some(d);
        }
        if let Some(docs) = patch.documents {
            self.documents = docs;
        }
        if let Some(g) = patch.grade {
            self.grade = Some(g);
        }
        if let Some(n) = patch.retry_count {
            self.retry_count = n;
        }
        if let Some(r) = patch.rewrite_rejected {
            self.rewrite_rejected = r;
        }
        if let Some(a) = patch.answer {
            self.answer = Some(a);
        }
        if let Some(g) = patch.generated {
            self.generated = g;
        }
        if let Some(t) = patch.finished_at {
            self.finished_at = Some(t);
        }
    }

    /// Whether generation should use retrieved evidence.
    pub fn wants_evidence(&self) -> bool {
        self.decision.as_ref().is_none_or(|d| d.needs_retrieval)
    }

    pub fn into_result(self, fallback_answer: &str) -> QueryResult {
        let finished_at = self.finished_at.unwrap_or_else(Utc::now);
        QueryResult {
            answer: self
                .answer
                .unwrap_or_else(|| fallback_answer.to_string()),
            query: self.query,
            processed_query: self.processed_query,
            trace: self.trace,
            retrieved_docs: self.documents,
            cache_hit: false,
            decision: self.decision,
            grade: self.grade,
            rewrite_count: self.retry_count,
            duration_ms: (finished_at - self.started_at).num_milliseconds(),
            started_at: self.started_at,
            finished_at,
        }
    }
}

/// Partial state update returned by a node.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub trace: Vec<NodeExecution>,
    pub processed_query: Option<String>,
    pub decision: Option<OrchestratorDecision>,
    pub documents: Option<Vec<RetrievedDocument>>,
    pub grade: Option<RetrievalGrade>,
    pub retry_count: Option<u32>,
    pub rewrite_rejected: Option<bool>,
    pub answer: Option<String>,
    pub generated: Option<bool>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StatePatch {
    pub fn step(step: NodeExecution) -> Self {
        Self {
            trace: vec![step],
            ..Default::default()
        }
    }

    /// Merge two patches produced concurrently. Traces concatenate in
    /// argument order; `other` wins conflicting fields.
    pub fn merge(mut self, other: StatePatch) -> Self {
        self.trace.extend(other.trace);
        self.processed_query = other.processed_query.or(self.processed_query);
        self.decision = other.decision.or(self.decision);
        self.documents = other.documents.or(self.documents);
        self.grade = other.grade.or(self.grade);
        self.retry_count = other.retry_count.or(self.retry_count);
        self.rewrite_rejected = other.rewrite_rejected.or(self.rewrite_rejected);
        self.answer = other.answer.or(self.answer);
        self.generated = other.generated.or(self.generated);
        self.finished_at = other.finished_at.or(self.finished_at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocumentSource, NodeStatus};

    #[test]
    fn test_apply_appends_trace_and_overwrites_fields() {
        let mut state = AgentState::new("q", QueryOptions::default());
        state.apply(StatePatch {
            answer: Some("first".into()),
            ..StatePatch::step(NodeExecution::start("a", None).complete(None))
        });
        state.apply(StatePatch {
            answer: Some("second".into()),
            ..StatePatch::step(NodeExecution::skipped("b", "bypassed"))
        });
        assert_eq!(state.trace.len(), 2);
        assert_eq!(state.trace[1].status, NodeStatus::Skipped);
        assert_eq!(state.answer.as_deref(), Some("second"));
        assert_eq!(state.processed_query, "q");
    }

    #[test]
    fn test_unset_fields_are_left_alone() {
        let mut state = AgentState::new("q", QueryOptions::default());
        state.apply(StatePatch {
            documents: Some(vec![RetrievedDocument::new("d", "c", 0.5, DocumentSource::Dense)]),
            ..Default::default()
        });
        state.apply(StatePatch::default());
        assert_eq!(state.documents.len(), 1);
    }

    #[test]
    fn test_merge_keeps_both_traces() {
        let left = StatePatch {
            decision: Some(OrchestratorDecision::small_talk()),
            ..StatePatch::step(NodeExecution::start("analyze_intent", None).complete(None))
        };
        let right = StatePatch {
            documents: Some(Vec::new()),
            ..StatePatch::step(NodeExecution::skipped("retrieve", "small talk"))
        };
        let merged = left.merge(right);
        assert_eq!(merged.trace.len(), 2);
        assert_eq!(merged.trace[0].name, "analyze_intent");
        assert!(merged.decision.is_some());
        assert!(merged.documents.is_some());
    }

    #[test]
    fn test_into_result_uses_fallback() {
        let state = AgentState::new("q", QueryOptions::default());
        let result = state.into_result("sorry");
        assert_eq!(result.answer, "sorry");
        assert!(!result.cache_hit);
        assert!(result.duration_ms >= 0);
    }

    #[test]
    fn test_wants_evidence() {
        let mut state = AgentState::new("q", QueryOptions::default());
        assert!(state.wants_evidence());
        state.decision = Some(OrchestratorDecision::small_talk());
        assert!(!state.wants_evidence());
    }
}
