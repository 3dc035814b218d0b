//! Compiled process graph: immutable activities, transitions and scope
//! nesting, produced by [`ProcessGraphBuilder`] and validated before use.
//!
//! The engine performs no DSL or XML parsing; graphs are assembled
//! programmatically and are never mutated after [`ProcessGraphBuilder::build`].

mod builder;
mod types;
mod validator;

use std::collections::HashMap;

use petgraph::stable_graph::StableDiGraph;

use crate::error::{EngineError, EngineResult};

pub use builder::{ActivityBuilder, ProcessGraphBuilder};
pub use types::{
    Activity, ActivityIndexMap, Behavior, ErrorHandler, Transition, TransitionIndexMap,
};
pub(crate) use validator::validate_graph;

/// Immutable compiled representation of one process definition.
#[derive(Debug)]
pub struct ProcessGraph {
    /// Definition key, unique per deployment.
    pub key: String,

    /// ID of the initial activity.
    pub initial: String,

    /// Default retry budget for jobs created from this graph.
    pub default_job_retries: u32,

    /// Process-level error handlers (outermost link of the handler chain).
    pub error_handlers: Vec<ErrorHandler>,

    pub(crate) graph: StableDiGraph<Activity, Transition>,
    pub(crate) activity_index: ActivityIndexMap,
    pub(crate) transition_index: TransitionIndexMap,

    // Outgoing/incoming transition IDs per activity, in declaration order.
    // petgraph iterates edges in reverse insertion order, so the order the
    // builder saw is kept separately.
    outgoing: HashMap<String, Vec<String>>,
    incoming: HashMap<String, Vec<String>>,
}

impl ProcessGraph {
    /// Start building a graph with the given definition key.
    pub fn builder(key: impl Into<String>) -> ProcessGraphBuilder {
        ProcessGraphBuilder::new(key)
    }

    /// Look up an activity by ID.
    pub fn activity(&self, id: &str) -> EngineResult<&Activity> {
        let idx = self
            .activity_index
            .get(id)
            .ok_or_else(|| EngineError::ActivityNotFound(id.to_string()))?;
        self.graph
            .node_weight(*idx)
            .ok_or_else(|| EngineError::ActivityNotFound(id.to_string()))
    }

    /// Look up a transition by ID.
    pub fn transition(&self, id: &str) -> EngineResult<&Transition> {
        let idx = self
            .transition_index
            .get(id)
            .ok_or_else(|| EngineError::TransitionNotFound(id.to_string()))?;
        self.graph
            .edge_weight(*idx)
            .ok_or_else(|| EngineError::TransitionNotFound(id.to_string()))
    }

    /// Outgoing transition IDs of an activity, in declaration order.
    pub fn outgoing(&self, activity_id: &str) -> &[String] {
        self.outgoing
            .get(activity_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Incoming transition IDs of an activity, in declaration order.
    pub fn incoming(&self, activity_id: &str) -> &[String] {
        self.incoming
            .get(activity_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Default (first declared) outgoing transition of an activity.
    pub fn default_outgoing(&self, activity_id: &str) -> Option<&str> {
        self.outgoing(activity_id).first().map(String::as_str)
    }

    /// Enclosing scope activities of `activity_id`, innermost first. The
    /// list ends at the process root (which has no activity).
    pub fn flow_scope_chain(&self, activity_id: &str) -> EngineResult<Vec<String>> {
        let mut chain = Vec::new();
        let mut current = self.activity(activity_id)?.parent_scope.clone();
        while let Some(scope_id) = current {
            current = self.activity(&scope_id)?.parent_scope.clone();
            chain.push(scope_id);
        }
        Ok(chain)
    }

    /// Error handlers declared on a scope; `None` addresses the process
    /// root.
    pub fn scope_handlers(&self, scope: Option<&str>) -> EngineResult<&[ErrorHandler]> {
        match scope {
            Some(id) => Ok(&self.activity(id)?.error_handlers),
            None => Ok(&self.error_handlers),
        }
    }

    /// All activity IDs, in declaration order.
    pub fn activity_ids(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|a| a.id.as_str())
    }
}
