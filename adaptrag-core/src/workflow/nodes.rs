//! The orchestration graph's nodes and conditional edges.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::graph::{Node, NodeAbort, Route, RunContext};
use super::state::{ANALYZE_INTENT, AgentState, NodeId, RETRIEVE, StatePatch};
use crate::error::{ProviderError, RagError};
use crate::grading::{QueryRewriter, RetrievalGrader, should_rewrite};
use crate::intent::{IntentAnalyzer, is_small_talk};
use crate::llm_json::truncate_chars;
use crate::provider::CompletionProvider;
use crate::retrieval::{HybridRetriever, RetrievalRequest, RetrievalStatus};
use crate::types::{
    DecisionKind, EngineEvent, NodeExecution, NodeStatus, OrchestratorDecision, RetrievedDocument,
    Role,
};

/// Runs a retrieval and turns its outcome into a trace record.
async fn run_retrieval(
    retriever: &HybridRetriever,
    name: &str,
    query: &str,
    request: &RetrievalRequest,
) -> (NodeExecution, Result<Vec<RetrievedDocument>, RagError>) {
    let step = NodeExecution::start(
        name,
        Some(json!({ "query": query, "top_k": request.top_k })),
    );
    match retriever.retrieve(query, request).await {
        Ok(outcome) => {
            let mut step = step.complete(Some(outcome.summary()));
            if outcome.status == RetrievalStatus::Skipped {
                step.status = NodeStatus::Skipped;
            }
            (step, Ok(outcome.documents))
        }
        Err(e) => {
            warn!(node = name, error = %e, "Retrieval failed");
            (step.fail(&e), Err(e.into()))
        }
    }
}

/// Intent analysis and first-pass retrieval, run concurrently.
pub struct FanOutJoinNode {
    analyzer: IntentAnalyzer,
    retriever: Arc<HybridRetriever>,
}

impl FanOutJoinNode {
    pub fn new(analyzer: IntentAnalyzer, retriever: Arc<HybridRetriever>) -> Self {
        Self {
            analyzer,
            retriever,
        }
    }
}

#[async_trait]
impl Node for FanOutJoinNode {
    fn id(&self) -> NodeId {
        NodeId::FanOutJoin
    }

    async fn run(&self, state: &AgentState, _ctx: &RunContext) -> Result<StatePatch, NodeAbort> {
        let query = state.query.as_str();
        let history = &state.options.history;
        let request = RetrievalRequest::from(&state.options);
        let small_talk = history.is_empty() && is_small_talk(query);

        let intent = async {
            let step = NodeExecution::start(ANALYZE_INTENT, Some(json!({ "query": query })));
            match self.analyzer.analyze(query, history).await {
                Ok(decision) => (step.complete(Some(json!(&decision))), Ok(decision)),
                Err(e) => {
                    warn!(error = %e, "Intent analysis failed, defaulting to retrieval");
                    (step.fail(&e), Err(e))
                }
            }
        };
        let retrieval = async {
            if small_talk {
                return (
                    NodeExecution::skipped(RETRIEVE, "small talk needs no evidence"),
                    Ok(Vec::new()),
                );
            }
            run_retrieval(&self.retriever, RETRIEVE, query, &request).await
        };

        let ((intent_step, intent_result), (retrieve_step, retrieval_result)) =
            tokio::join!(intent, retrieval);

        let mut fatal: Option<RagError> = None;
        let decision = match intent_result {
            Ok(decision) => decision,
            Err(e) => {
                if e.is_fatal() {
                    fatal = Some(e.into());
                }
                OrchestratorDecision::default_retrieve(query)
            }
        };
        let documents = match retrieval_result {
            Ok(documents) => documents,
            Err(e) => {
                if e.is_fatal() && fatal.is_none() {
                    fatal = Some(e);
                }
                Vec::new()
            }
        };

        debug!(
            kind = %decision.kind,
            needs_retrieval = decision.needs_retrieval,
            documents = documents.len(),
            "Fan-out joined"
        );
        let documents = if decision.needs_retrieval {
            documents
        } else {
            Vec::new()
        };
        let intent_patch = StatePatch {
            decision: Some(decision),
            ..StatePatch::step(intent_step)
        };
        let retrieval_patch = StatePatch {
            documents: Some(documents),
            ..StatePatch::step(retrieve_step)
        };
        let patch = intent_patch.merge(retrieval_patch);
        match fatal {
            Some(error) => Err(NodeAbort { patch, error }),
            None => Ok(patch),
        }
    }
}

/// Skip grading entirely when the turn needs no evidence.
pub fn after_fan_out(state: &AgentState) -> Route {
    if state.wants_evidence() {
        Route::to(NodeId::GradeRetrieval)
    } else {
        Route::bypassing(
            NodeId::Generate,
            vec![NodeId::GradeRetrieval],
            "retrieval not needed",
        )
    }
}

pub struct GradeRetrievalNode {
    grader: RetrievalGrader,
}

impl GradeRetrievalNode {
    pub fn new(grader: RetrievalGrader) -> Self {
        Self { grader }
    }
}

#[async_trait]
impl Node for GradeRetrievalNode {
    fn id(&self) -> NodeId {
        NodeId::GradeRetrieval
    }

    async fn run(&self, state: &AgentState, _ctx: &RunContext) -> Result<StatePatch, NodeAbort> {
        let step = NodeExecution::start(
            NodeId::GradeRetrieval.as_str(),
            Some(json!({
                "query": state.query,
                "documents": state.documents.len(),
                "retry_count": state.retry_count,
            })),
        );
        let outcome = self
            .grader
            .grade(
                &state.query,
                &state.documents,
                state.options.grade_pass_threshold,
            )
            .await;
        info!(
            score = outcome.grade.score,
            relevant = outcome.grade.is_relevant,
            retry_count = state.retry_count,
            "Retrieval graded"
        );
        let step = step.complete(Some(json!({
            "score": outcome.grade.score,
            "is_relevant": outcome.grade.is_relevant,
            "method": outcome.method,
            "reasoning": outcome.grade.reasoning,
        })));
        Ok(StatePatch {
            grade: Some(outcome.grade),
            ..StatePatch::step(step)
        })
    }
}

/// Rewrite while the evidence fails and the single rewrite is unused.
pub fn after_grade(state: &AgentState) -> Route {
    let rewrite = !state.rewrite_rejected
        && state
            .grade
            .as_ref()
            .is_some_and(|g| should_rewrite(g, state.retry_count, state.options.max_retries));
    if rewrite {
        Route::to(NodeId::RewriteQuery)
    } else {
        Route::to(NodeId::Generate)
    }
}

pub struct RewriteQueryNode {
    rewriter: QueryRewriter,
}

impl RewriteQueryNode {
    pub fn new(rewriter: QueryRewriter) -> Self {
        Self { rewriter }
    }
}

#[async_trait]
impl Node for RewriteQueryNode {
    fn id(&self) -> NodeId {
        NodeId::RewriteQuery
    }

    async fn run(&self, state: &AgentState, _ctx: &RunContext) -> Result<StatePatch, NodeAbort> {
        let feedback = state
            .grade
            .as_ref()
            .map(|g| g.reasoning.as_str())
            .unwrap_or_default();
        let step = NodeExecution::start(
            NodeId::RewriteQuery.as_str(),
            Some(json!({ "query": state.processed_query, "feedback": feedback })),
        );
        let outcome = self
            .rewriter
            .rewrite(&state.query, &state.processed_query, feedback)
            .await;

        let output = json!({
            "query": outcome.query,
            "accepted": outcome.accepted,
            "rejection": outcome.rejection,
        });
        let step = if outcome.failed {
            step.fail(outcome.rejection.as_deref().unwrap_or("rewrite failed"))
        } else {
            step.complete(Some(output))
        };

        let mut patch = StatePatch {
            retry_count: Some(state.retry_count + 1),
            ..StatePatch::step(step)
        };
        if outcome.accepted {
            patch.processed_query = Some(outcome.query);
        } else {
            patch.rewrite_rejected = Some(true);
        }
        Ok(patch)
    }
}

/// A refused rewrite goes straight to generation with the evidence at hand.
pub fn after_rewrite(state: &AgentState) -> Route {
    if state.rewrite_rejected {
        Route::bypassing(
            NodeId::Generate,
            vec![NodeId::RetrieveAfterRewrite],
            "rewrite rejected",
        )
    } else {
        Route::to(NodeId::RetrieveAfterRewrite)
    }
}

pub struct RetrieveAfterRewriteNode {
    retriever: Arc<HybridRetriever>,
}

impl RetrieveAfterRewriteNode {
    pub fn new(retriever: Arc<HybridRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Node for RetrieveAfterRewriteNode {
    fn id(&self) -> NodeId {
        NodeId::RetrieveAfterRewrite
    }

    async fn run(&self, state: &AgentState, _ctx: &RunContext) -> Result<StatePatch, NodeAbort> {
        let request = RetrievalRequest::from(&state.options);
        let (step, result) = run_retrieval(
            &self.retriever,
            NodeId::RetrieveAfterRewrite.as_str(),
            &state.processed_query,
            &request,
        )
        .await;
        match result {
            Ok(documents) => Ok(StatePatch {
                documents: Some(documents),
                ..StatePatch::step(step)
            }),
            Err(error) if error.is_fatal() => Err(NodeAbort {
                patch: StatePatch::step(step),
                error,
            }),
            // Keep the first-pass evidence.
            Err(_) => Ok(StatePatch::step(step)),
        }
    }
}

/// Produces the answer, streaming tokens to the caller when asked to.
pub struct GenerateNode {
    llm: Arc<dyn CompletionProvider>,
    temperature: f32,
    system_prompt: String,
    fallback_answer: String,
}

const HISTORY_CHAR_LIMIT: usize = 1_000;

impl GenerateNode {
    pub fn new(
        llm: Arc<dyn CompletionProvider>,
        temperature: f32,
        system_prompt: impl Into<String>,
        fallback_answer: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            temperature,
            system_prompt: system_prompt.into(),
            fallback_answer: fallback_answer.into(),
        }
    }

    fn build_prompt(&self, state: &AgentState) -> String {
        let mut prompt = format!("{}\n", self.system_prompt);

        let history: Vec<_> = state
            .options
            .history
            .iter()
            .filter(|m| m.role != Role::System || m.is_summary)
            .collect();
        if !history.is_empty() {
            prompt.push_str("\nConversation so far:\n");
            for msg in history {
                prompt.push_str(&format!(
                    "{}: {}\n",
                    msg.role,
                    truncate_chars(&msg.content, HISTORY_CHAR_LIMIT)
                ));
            }
        }

        if state.wants_evidence() {
            if state.documents.is_empty() {
                prompt.push_str(
                    "\nNo relevant documents were found. Say so if you cannot answer reliably.\n",
                );
            } else {
                prompt.push_str("\nContext documents:\n");
                for (i, doc) in state.documents.iter().enumerate() {
                    prompt.push_str(&format!("[{}] {}\n", i + 1, doc.content));
                }
            }
        }

        if state
            .decision
            .as_ref()
            .is_some_and(|d| d.kind == DecisionKind::Clarify)
        {
            prompt.push_str(
                "\nThe request is ambiguous. Ask the user one short clarifying question instead of answering.\n",
            );
        }

        prompt.push_str(&format!("\nQuestion: {}\nAnswer:", state.query));
        prompt
    }

    /// Stream tokens to `events` while accumulating the full answer.
    async fn stream(
        &self,
        prompt: &str,
        events: &mpsc::Sender<EngineEvent>,
    ) -> (Result<(), ProviderError>, String) {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let forward = async {
            let mut answer = String::new();
            while let Some(token) = rx.recv().await {
                answer.push_str(&token);
                let _ = events.send(EngineEvent::Token(token)).await;
            }
            answer
        };
        tokio::join!(
            self.llm.complete_streaming(prompt, self.temperature, tx),
            forward
        )
    }
}

#[async_trait]
impl Node for GenerateNode {
    fn id(&self) -> NodeId {
        NodeId::Generate
    }

    async fn run(&self, state: &AgentState, ctx: &RunContext) -> Result<StatePatch, NodeAbort> {
        let prompt = self.build_prompt(state);
        let streaming = ctx.events.is_some();
        let step = NodeExecution::start(
            NodeId::Generate.as_str(),
            Some(json!({
                "documents": state.documents.len(),
                "streaming": streaming,
                "model": self.llm.model_name(),
            })),
        );

        let (result, streamed) = match &ctx.events {
            Some(events) => {
                let (result, answer) = self.stream(&prompt, events).await;
                (result.map(|()| answer.clone()), !answer.is_empty())
            }
            None => (self.llm.complete(&prompt, self.temperature).await, false),
        };
        let result = result.and_then(|answer| {
            let trimmed = answer.trim();
            if trimmed.is_empty() {
                Err(ProviderError::ResponseParse {
                    message: "empty completion".to_string(),
                })
            } else {
                Ok(trimmed.to_string())
            }
        });

        match result {
            Ok(answer) => {
                info!(chars = answer.chars().count(), streaming, "Answer generated");
                let step = step.complete(Some(json!({ "chars": answer.chars().count() })));
                Ok(StatePatch {
                    answer: Some(answer),
                    generated: Some(true),
                    ..StatePatch::step(step)
                })
            }
            Err(e) if e.is_fatal() => Err(NodeAbort::new(step.fail(&e), e)),
            Err(e) => {
                warn!(error = %e, "Generation failed, using fallback answer");
                if !streamed {
                    ctx.emit(EngineEvent::Token(self.fallback_answer.clone()))
                        .await;
                }
                Ok(StatePatch {
                    answer: Some(self.fallback_answer.clone()),
                    generated: Some(false),
                    ..StatePatch::step(step.fail(&e))
                })
            }
        }
    }
}

/// Stamps the end of the turn.
pub struct FinalizeNode;

#[async_trait]
impl Node for FinalizeNode {
    fn id(&self) -> NodeId {
        NodeId::Finalize
    }

    async fn run(&self, state: &AgentState, _ctx: &RunContext) -> Result<StatePatch, NodeAbort> {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - state.started_at).num_milliseconds();
        let step = NodeExecution::start(NodeId::Finalize.as_str(), None).complete(Some(json!({
            "duration_ms": duration_ms,
            "steps": state.trace.len() + 1,
            "rewrites": state.retry_count,
        })));
        Ok(StatePatch {
            finished_at: Some(finished_at),
            ..StatePatch::step(step)
        })
    }
}
