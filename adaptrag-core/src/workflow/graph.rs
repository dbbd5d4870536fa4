//! A small explicit state machine: named nodes, static or conditional edges,
//! a hard step budget.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::state::{AgentState, GRAPH, NodeId, StatePatch};
use crate::error::{RagError, WorkflowError};
use crate::types::{EngineEvent, NodeExecution};

/// Per-run context handed to every node.
#[derive(Clone, Default)]
pub struct RunContext {
    /// Present for streaming runs.
    pub events: Option<mpsc::Sender<EngineEvent>>,
}

impl RunContext {
    pub fn streaming(events: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            events: Some(events),
        }
    }

    /// Publish an event to a streaming caller. A caller that went away is
    /// not an error for the turn.
    pub async fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

/// A fatal node failure. `patch` carries the node's error record so the
/// aborted trace still shows it.
#[derive(Debug)]
pub struct NodeAbort {
    pub patch: StatePatch,
    pub error: RagError,
}

impl NodeAbort {
    pub fn new(step: NodeExecution, error: impl Into<RagError>) -> Self {
        Self {
            patch: StatePatch::step(step),
            error: error.into(),
        }
    }
}

/// One graph node.
#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> NodeId;

    async fn run(&self, state: &AgentState, ctx: &RunContext) -> Result<StatePatch, NodeAbort>;
}

/// Where control goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Node(NodeId),
    End,
}

/// Decision of a conditional edge. `bypassed` nodes are recorded as skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub next: Target,
    pub bypassed: Vec<NodeId>,
    pub reason: &'static str,
}

impl Route {
    pub fn to(next: NodeId) -> Self {
        Self {
            next: Target::Node(next),
            bypassed: Vec::new(),
            reason: "",
        }
    }

    pub fn bypassing(next: NodeId, bypassed: Vec<NodeId>, reason: &'static str) -> Self {
        Self {
            next: Target::Node(next),
            bypassed,
            reason,
        }
    }
}

pub type Condition = fn(&AgentState) -> Route;

pub enum Edge {
    To(Target),
    Conditional(Condition),
}

/// Directed graph of nodes executed one at a time.
pub struct StateGraph {
    entry: NodeId,
    nodes: HashMap<NodeId, Arc<dyn Node>>,
    edges: HashMap<NodeId, Edge>,
    finalizer: Option<NodeId>,
    max_steps: usize,
    fallback_answer: String,
}

impl StateGraph {
    pub fn new(entry: NodeId, max_steps: usize, fallback_answer: impl Into<String>) -> Self {
        Self {
            entry,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            finalizer: None,
            max_steps: max_steps.max(1),
            fallback_answer: fallback_answer.into(),
        }
    }

    pub fn add_node(mut self, node: Arc<dyn Node>) -> Self {
        self.nodes.insert(node.id(), node);
        self
    }

    pub fn add_edge(mut self, from: NodeId, to: NodeId) -> Self {
        self.edges.insert(from, Edge::To(Target::Node(to)));
        self
    }

    pub fn add_conditional_edge(mut self, from: NodeId, condition: Condition) -> Self {
        self.edges.insert(from, Edge::Conditional(condition));
        self
    }

    /// Mark the terminal node. It runs last, and also runs when the step
    /// budget is exhausted.
    pub fn set_finalizer(mut self, node: NodeId) -> Self {
        self.edges.insert(node, Edge::To(Target::End));
        self.finalizer = Some(node);
        self
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Check that every node has an outgoing edge and static edges point at
    /// registered nodes.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if !self.nodes.contains_key(&self.entry) {
            return Err(WorkflowError::NodeNotFound {
                node: self.entry.to_string(),
            });
        }
        for id in self.nodes.keys() {
            match self.edges.get(id) {
                None => {
                    return Err(WorkflowError::MissingEdge {
                        node: id.to_string(),
                    });
                }
                Some(Edge::To(Target::Node(next))) if !self.nodes.contains_key(next) => {
                    return Err(WorkflowError::NodeNotFound {
                        node: next.to_string(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn next(&self, from: NodeId, state: &AgentState) -> Result<Route, WorkflowError> {
        match self.edges.get(&from) {
            Some(Edge::To(target)) => Ok(Route {
                next: *target,
                bypassed: Vec::new(),
                reason: "",
            }),
            Some(Edge::Conditional(condition)) => Ok(condition(state)),
            None => Err(WorkflowError::MissingEdge {
                node: from.to_string(),
            }),
        }
    }

    async fn apply(&self, state: &mut AgentState, patch: StatePatch, ctx: &RunContext) {
        for step in &patch.trace {
            ctx.emit(EngineEvent::Workflow(step.clone())).await;
        }
        state.apply(patch);
    }

    async fn run_node(
        &self,
        id: NodeId,
        state: &mut AgentState,
        ctx: &RunContext,
    ) -> Result<(), RagError> {
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| WorkflowError::NodeNotFound { node: id.to_string() })?;
        debug!(node = %id, "Entering node");
        match node.run(state, ctx).await {
            Ok(patch) => {
                self.apply(state, patch, ctx).await;
                Ok(())
            }
            Err(abort) => {
                warn!(node = %id, error = %abort.error, "Fatal error, aborting turn");
                self.apply(state, abort.patch, ctx).await;
                Err(RagError::TurnAborted {
                    node: id.to_string(),
                    source: Box::new(abort.error),
                    trace: std::mem::take(&mut state.trace),
                })
            }
        }
    }

    /// Run the graph from the entry node until a node routes to the end.
    pub async fn run(&self, mut state: AgentState, ctx: &RunContext) -> Result<AgentState, RagError> {
        let mut current = self.entry;
        let mut steps = 0;

        loop {
            if steps >= self.max_steps {
                warn!(max = self.max_steps, "Step budget exhausted");
                let step = NodeExecution::start(GRAPH, None)
                    .fail(WorkflowError::StepBudgetExceeded { max: self.max_steps });
                let mut patch = StatePatch::step(step);
                if state.answer.is_none() {
                    patch.answer = Some(self.fallback_answer.clone());
                }
                self.apply(&mut state, patch, ctx).await;
                if let Some(finalizer) = self.finalizer {
                    self.run_node(finalizer, &mut state, ctx).await?;
                }
                return Ok(state);
            }

            steps += 1;
            self.run_node(current, &mut state, ctx).await?;

            let route = self.next(current, &state)?;
            for skipped in &route.bypassed {
                let record = NodeExecution::skipped(skipped.as_str(), route.reason);
                self.apply(&mut state, StatePatch::step(record), ctx).await;
            }
            match route.next {
                Target::Node(next) => current = next,
                Target::End => return Ok(state),
            }
        }
    }
}
