//! Turn orchestration: the state graph, its nodes and the public engine.

pub mod engine;
pub mod graph;
pub mod nodes;
pub mod state;

pub use engine::{RagEngine, RagEngineBuilder};
pub use graph::{Edge, Node, NodeAbort, Route, RunContext, StateGraph, Target};
pub use state::{AgentState, NodeId, StatePatch};
