//! The public engine: semantic cache in front of the orchestration graph,
//! cache write and verification behind it.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::graph::{RunContext, StateGraph};
use super::nodes::{
    FanOutJoinNode, FinalizeNode, GenerateNode, GradeRetrievalNode, RetrieveAfterRewriteNode,
    RewriteQueryNode, after_fan_out, after_grade, after_rewrite,
};
use super::state::{AgentState, CACHE_CHECK, NodeId};
use crate::cache::{CacheHit, CacheMetrics, SemanticCache, SemanticCacheEntry};
use crate::config::EngineConfig;
use crate::error::{ConfigError, RagError, Result};
use crate::grading::{QueryRewriter, RetrievalGrader};
use crate::intent::IntentAnalyzer;
use crate::provider::{CompletionProvider, EmbeddingProvider};
use crate::providers::create_providers;
use crate::retrieval::{HybridRetriever, LlmReranker, Reranker};
use crate::store::VectorStore;
use crate::types::{CorrectionEvent, EngineEvent, NodeExecution, QueryOptions, QueryResult};
use crate::verification::Verifier;

/// Events buffered between a streaming turn and its consumer.
const STREAM_BUFFER: usize = 64;

/// Assembles a [`RagEngine`] from injected providers.
pub struct RagEngineBuilder {
    llm: Arc<dyn CompletionProvider>,
    fast_llm: Option<Arc<dyn CompletionProvider>>,
    embedder: Arc<dyn EmbeddingProvider>,
    alternates: Vec<Arc<dyn EmbeddingProvider>>,
    store: Arc<dyn VectorStore>,
    reranker: Option<Arc<dyn Reranker>>,
    config: EngineConfig,
}

impl RagEngineBuilder {
    /// Model used for intent, grading, rewrite, rerank and verification.
    /// Defaults to the main model.
    pub fn fast_llm(mut self, llm: Arc<dyn CompletionProvider>) -> Self {
        self.fast_llm = Some(llm);
        self
    }

    /// Embedder tried when the primary does not match the store dimension.
    pub fn alternate_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.alternates.push(embedder);
        self
    }

    /// Replace the default judge-model reranker.
    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<RagEngine> {
        self.config.check()?;
        for warning in self.config.validate() {
            warn!(%warning, "Configuration warning");
        }

        let config = self.config;
        let judge = self.fast_llm.unwrap_or_else(|| Arc::clone(&self.llm));
        let judge_temperature = config.llm.judge_temperature;

        let reranker = self.reranker.unwrap_or_else(|| {
            Arc::new(LlmReranker::new(Arc::clone(&judge)).with_temperature(judge_temperature))
        });
        let mut retriever = HybridRetriever::new(
            self.store,
            Arc::clone(&self.embedder),
            config.retrieval.clone(),
        )
        .with_reranker(reranker);
        for alternate in self.alternates {
            retriever = retriever.with_alternate_embedder(alternate);
        }
        let retriever = Arc::new(retriever);

        let graph = StateGraph::new(
            NodeId::FanOutJoin,
            config.workflow.max_steps,
            config.workflow.fallback_answer.clone(),
        )
        .add_node(Arc::new(FanOutJoinNode::new(
            IntentAnalyzer::new(Arc::clone(&judge)).with_temperature(judge_temperature),
            Arc::clone(&retriever),
        )))
        .add_node(Arc::new(GradeRetrievalNode::new(
            RetrievalGrader::new(Arc::clone(&judge), &config.grading)
                .with_temperature(judge_temperature),
        )))
        .add_node(Arc::new(RewriteQueryNode::new(
            QueryRewriter::new(Arc::clone(&judge)).with_temperature(judge_temperature),
        )))
        .add_node(Arc::new(RetrieveAfterRewriteNode::new(Arc::clone(&retriever))))
        .add_node(Arc::new(GenerateNode::new(
            Arc::clone(&self.llm),
            config.llm.temperature,
            config.workflow.system_prompt.clone(),
            config.workflow.fallback_answer.clone(),
        )))
        .add_node(Arc::new(FinalizeNode))
        .add_conditional_edge(NodeId::FanOutJoin, after_fan_out)
        .add_conditional_edge(NodeId::GradeRetrieval, after_grade)
        .add_conditional_edge(NodeId::RewriteQuery, after_rewrite)
        .add_edge(NodeId::RetrieveAfterRewrite, NodeId::GradeRetrieval)
        .add_edge(NodeId::Generate, NodeId::Finalize)
        .set_finalizer(NodeId::Finalize);
        graph.validate()?;

        let verifier = config
            .verification
            .enabled
            .then(|| Verifier::new(judge, &config.verification));

        info!(
            model = self.llm.model_name(),
            embedder = self.embedder.model_name(),
            cache = config.cache.enabled,
            verification = config.verification.enabled,
            "RAG engine ready"
        );

        Ok(RagEngine {
            cache: SemanticCache::from_config(&config.cache),
            config,
            embedder: self.embedder,
            graph,
            verifier,
        })
    }
}

/// Adaptive retrieval-augmented generation engine.
///
/// Safe to share across concurrent turns; the semantic cache is the only
/// state one turn leaves behind for the next.
pub struct RagEngine {
    config: EngineConfig,
    /// Embeds queries for the semantic cache.
    embedder: Arc<dyn EmbeddingProvider>,
    cache: SemanticCache,
    graph: StateGraph,
    verifier: Option<Verifier>,
}

impl RagEngine {
    pub fn builder(
        llm: Arc<dyn CompletionProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> RagEngineBuilder {
        RagEngineBuilder {
            llm,
            fast_llm: None,
            embedder,
            alternates: Vec::new(),
            store,
            reranker: None,
            config: EngineConfig::default(),
        }
    }

    /// Build an engine whose providers come from configuration.
    pub fn from_config(config: EngineConfig, store: Arc<dyn VectorStore>) -> Result<Self> {
        let providers = create_providers(&config)?;
        let mut embedders = providers.embedders.into_iter();
        let embedder = embedders.next().ok_or_else(|| ConfigError::MissingField {
            field: "embedding.model".to_string(),
        })?;
        let mut builder = Self::builder(providers.llm, embedder, store).config(config);
        if let Some(fast) = providers.fast_llm {
            builder = builder.fast_llm(fast);
        }
        for alternate in embedders {
            builder = builder.alternate_embedder(alternate);
        }
        builder.build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Per-request defaults derived from the configuration.
    pub fn default_options(&self) -> QueryOptions {
        QueryOptions::from_config(&self.config)
    }

    /// Run one turn to completion.
    pub async fn query(&self, input: &str, options: QueryOptions) -> Result<QueryResult> {
        self.run_turn(input, options, RunContext::default()).await
    }

    /// Run one turn, streaming trace steps and answer tokens.
    ///
    /// The stream ends with `Done` carrying the same result [`query`] would
    /// return, or `Error` for an aborted turn. Must be called inside a
    /// tokio runtime.
    ///
    /// [`query`]: RagEngine::query
    pub fn stream_query(
        self: &Arc<Self>,
        input: impl Into<String>,
        options: QueryOptions,
    ) -> ReceiverStream<EngineEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let engine = Arc::clone(self);
        let input = input.into();
        tokio::spawn(async move {
            let ctx = RunContext::streaming(tx.clone());
            let event = match engine.run_turn(&input, options, ctx).await {
                Ok(result) => EngineEvent::Done(Box::new(result)),
                Err(e) => EngineEvent::Error(e.to_string()),
            };
            let _ = tx.send(event).await;
        });
        ReceiverStream::new(rx)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Corrections published by post-hoc verification. `None` when
    /// verification is disabled.
    pub fn subscribe_corrections(&self) -> Option<broadcast::Receiver<CorrectionEvent>> {
        self.verifier.as_ref().map(Verifier::subscribe)
    }

    async fn run_turn(
        &self,
        input: &str,
        options: QueryOptions,
        ctx: RunContext,
    ) -> Result<QueryResult> {
        let started_at = Utc::now();
        let skip_cache_write = options.skip_cache_write;
        let mut query_embedding = None;

        let cache_step = if !self.config.cache.enabled {
            NodeExecution::skipped(CACHE_CHECK, "semantic cache disabled")
        } else if options.skip_semantic_cache {
            NodeExecution::skipped(CACHE_CHECK, "bypassed by caller")
        } else {
            let step = NodeExecution::start(CACHE_CHECK, Some(json!({ "query": input })));
            match self.embedder.embed(input).await {
                Ok(embedding) => match self.cache.lookup(&embedding) {
                    Some(hit) => return Ok(self.serve_hit(input, hit, step, started_at, &ctx).await),
                    None => {
                        query_embedding = Some(embedding);
                        step.complete(Some(json!({ "hit": false })))
                    }
                },
                Err(e) if e.is_fatal() => {
                    let step = step.fail(&e);
                    ctx.emit(EngineEvent::Workflow(step.clone())).await;
                    return Err(RagError::TurnAborted {
                        node: CACHE_CHECK.to_string(),
                        source: Box::new(e.into()),
                        trace: vec![step],
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Cache lookup embedding failed, continuing without cache");
                    step.fail(&e)
                }
            }
        };
        ctx.emit(EngineEvent::Workflow(cache_step.clone())).await;

        let mut state = AgentState::new(input, options);
        state.started_at = started_at;
        state.trace.push(cache_step);

        let state = self.graph.run(state, &ctx).await?;
        let generated = state.generated;
        let result = state.into_result(&self.config.workflow.fallback_answer);

        if generated {
            if self.config.cache.enabled && !skip_cache_write {
                self.write_cache(&result, query_embedding).await;
            }
            if let Some(verifier) = &self.verifier
                && !result.retrieved_docs.is_empty()
            {
                // Detached; corrections arrive through `subscribe_corrections`.
                drop(verifier.spawn(
                    result.query.clone(),
                    result.answer.clone(),
                    result.retrieved_docs.clone(),
                ));
            }
        }

        info!(
            query = input,
            steps = result.trace.len(),
            rewrites = result.rewrite_count,
            documents = result.retrieved_docs.len(),
            duration_ms = result.duration_ms,
            "Turn complete"
        );
        Ok(result)
    }

    async fn serve_hit(
        &self,
        input: &str,
        hit: CacheHit,
        step: NodeExecution,
        started_at: chrono::DateTime<Utc>,
        ctx: &RunContext,
    ) -> QueryResult {
        debug!(similarity = hit.similarity, cached = %hit.entry.query, "Semantic cache hit");
        let step = step.complete(Some(json!({
            "hit": true,
            "similarity": hit.similarity,
            "cached_query": hit.entry.query,
        })));
        ctx.emit(EngineEvent::Workflow(step.clone())).await;
        ctx.emit(EngineEvent::Token(hit.entry.answer.clone())).await;

        let finished_at = Utc::now();
        QueryResult {
            answer: hit.entry.answer,
            query: input.to_string(),
            processed_query: input.to_string(),
            trace: vec![step],
            retrieved_docs: hit.entry.context,
            cache_hit: true,
            decision: None,
            grade: None,
            rewrite_count: 0,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
        }
    }

    async fn write_cache(&self, result: &QueryResult, embedding: Option<Vec<f32>>) {
        let embedding = match embedding {
            Some(embedding) => embedding,
            None => match self.embedder.embed(&result.query).await {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!(error = %e, "Could not embed query for caching");
                    return;
                }
            },
        };
        let id = self.cache.insert(SemanticCacheEntry::new(
            embedding,
            result.query.clone(),
            result.answer.clone(),
            result.retrieved_docs.clone(),
        ));
        debug!(%id, entries = self.cache.len(), "Answer cached");
    }
}
