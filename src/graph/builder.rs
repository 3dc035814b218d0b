//! Fluent builder assembling a validated [`ProcessGraph`].

use std::collections::HashMap;

use petgraph::stable_graph::StableDiGraph;

use crate::error::{EngineError, EngineResult};

use super::types::*;
use super::{validate_graph, ProcessGraph};

/// Configures one activity before it is added to the graph.
#[derive(Debug)]
pub struct ActivityBuilder {
    activity: Activity,
}

impl ActivityBuilder {
    pub fn new(id: impl Into<String>, behavior: Behavior) -> Self {
        let id = id.into();
        Self {
            activity: Activity {
                name: id.clone(),
                id,
                is_scope: false,
                is_cancel_scope: false,
                is_interrupt_scope: false,
                is_async: false,
                parent_scope: None,
                behavior,
                error_handlers: Vec::new(),
                job_priority: 0,
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.activity.name = name.into();
        self
    }

    /// Mark the activity as a scope boundary.
    pub fn scope(mut self) -> Self {
        self.activity.is_scope = true;
        self
    }

    /// Mark the activity as cancelling its owning scope when instantiated.
    pub fn cancel_scope(mut self) -> Self {
        self.activity.is_cancel_scope = true;
        self
    }

    /// Mark the activity as interrupting its owning scope when entered.
    pub fn interrupt_scope(mut self) -> Self {
        self.activity.is_interrupt_scope = true;
        self
    }

    /// Defer execution across a transaction boundary via a job.
    pub fn asynchronous(mut self) -> Self {
        self.activity.is_async = true;
        self
    }

    /// Nest the activity inside the given scope activity.
    pub fn in_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.activity.parent_scope = Some(scope_id.into());
        self
    }

    /// Declare an error handler on this scope activity. `None` catches all
    /// codes.
    pub fn error_handler(
        mut self,
        error_code: Option<impl Into<String>>,
        handler: impl Into<String>,
    ) -> Self {
        self.activity.error_handlers.push(ErrorHandler {
            error_code: error_code.map(Into::into),
            handler: handler.into(),
        });
        self
    }

    /// Priority for jobs created from this activity (higher acquires first).
    pub fn job_priority(mut self, priority: i64) -> Self {
        self.activity.job_priority = priority;
        self
    }
}

/// Builder for [`ProcessGraph`]; `build` validates the assembled graph and
/// rejects malformed usage before any instance can be started.
#[derive(Debug)]
pub struct ProcessGraphBuilder {
    key: String,
    initial: Option<String>,
    default_job_retries: u32,
    activities: Vec<Activity>,
    transitions: Vec<Transition>,
    error_handlers: Vec<ErrorHandler>,
}

impl ProcessGraphBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            initial: None,
            default_job_retries: 3,
            activities: Vec::new(),
            transitions: Vec::new(),
            error_handlers: Vec::new(),
        }
    }

    /// Add an activity.
    pub fn activity(mut self, activity: ActivityBuilder) -> Self {
        self.activities.push(activity.activity);
        self
    }

    /// Add a transition between two activities.
    pub fn transition(
        mut self,
        id: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        self.transitions.push(Transition {
            id: id.into(),
            source: source.into(),
            destination: destination.into(),
        });
        self
    }

    /// Set the initial activity of the process.
    pub fn initial(mut self, activity_id: impl Into<String>) -> Self {
        self.initial = Some(activity_id.into());
        self
    }

    /// Default retry budget for jobs created from this graph.
    pub fn default_job_retries(mut self, retries: u32) -> Self {
        self.default_job_retries = retries;
        self
    }

    /// Declare a process-level error handler.
    pub fn error_handler(
        mut self,
        error_code: Option<impl Into<String>>,
        handler: impl Into<String>,
    ) -> Self {
        self.error_handlers.push(ErrorHandler {
            error_code: error_code.map(Into::into),
            handler: handler.into(),
        });
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> EngineResult<ProcessGraph> {
        let initial = self
            .initial
            .ok_or_else(|| EngineError::GraphBuild(format!("{}: no initial activity", self.key)))?;

        let mut graph = StableDiGraph::new();
        let mut activity_index = ActivityIndexMap::new();
        let mut transition_index = TransitionIndexMap::new();
        let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<String>> = HashMap::new();

        for activity in self.activities {
            if activity_index.contains_key(&activity.id) {
                return Err(EngineError::GraphBuild(format!(
                    "duplicate activity id: {}",
                    activity.id
                )));
            }
            let id = activity.id.clone();
            let idx = graph.add_node(activity);
            activity_index.insert(id, idx);
        }

        for transition in self.transitions {
            if transition_index.contains_key(&transition.id) {
                return Err(EngineError::GraphBuild(format!(
                    "duplicate transition id: {}",
                    transition.id
                )));
            }
            let source_idx = *activity_index.get(&transition.source).ok_or_else(|| {
                EngineError::GraphBuild(format!(
                    "transition {} references unknown source {}",
                    transition.id, transition.source
                ))
            })?;
            let destination_idx =
                *activity_index.get(&transition.destination).ok_or_else(|| {
                    EngineError::GraphBuild(format!(
                        "transition {} references unknown destination {}",
                        transition.id, transition.destination
                    ))
                })?;

            outgoing
                .entry(transition.source.clone())
                .or_default()
                .push(transition.id.clone());
            incoming
                .entry(transition.destination.clone())
                .or_default()
                .push(transition.id.clone());

            let id = transition.id.clone();
            let idx = graph.add_edge(source_idx, destination_idx, transition);
            transition_index.insert(id, idx);
        }

        let built = ProcessGraph {
            key: self.key,
            initial,
            default_job_retries: self.default_job_retries,
            error_handlers: self.error_handlers,
            graph,
            activity_index,
            transition_index,
            outgoing,
            incoming,
        };

        validate_graph(&built)?;
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_minimal_graph() {
        let graph = ProcessGraph::builder("p")
            .activity(ActivityBuilder::new("start", Behavior::Automatic))
            .activity(ActivityBuilder::new("end", Behavior::End))
            .transition("t1", "start", "end")
            .initial("start")
            .build()
            .unwrap();

        assert_eq!(graph.key, "p");
        assert_eq!(graph.initial, "start");
        assert_eq!(graph.outgoing("start"), &["t1".to_string()]);
        assert_eq!(graph.incoming("end"), &["t1".to_string()]);
        assert_eq!(graph.default_outgoing("end"), None);
        assert_eq!(graph.transition("t1").unwrap().destination, "end");
    }

    #[test]
    fn test_duplicate_activity_rejected() {
        let err = ProcessGraph::builder("p")
            .activity(ActivityBuilder::new("a", Behavior::Automatic))
            .activity(ActivityBuilder::new("a", Behavior::End))
            .initial("a")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate activity id: a"));
    }

    #[test]
    fn test_unknown_transition_endpoint_rejected() {
        let err = ProcessGraph::builder("p")
            .activity(ActivityBuilder::new("a", Behavior::Automatic))
            .transition("t1", "a", "missing")
            .initial("a")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown destination"));
    }

    #[test]
    fn test_missing_initial_rejected() {
        let err = ProcessGraph::builder("p")
            .activity(ActivityBuilder::new("a", Behavior::Automatic))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no initial activity"));
    }

    #[test]
    fn test_flow_scope_chain() {
        let graph = ProcessGraph::builder("p")
            .activity(
                ActivityBuilder::new(
                    "outer",
                    Behavior::EmbeddedSubprocess {
                        initial: "inner".into(),
                    },
                )
                .scope(),
            )
            .activity(
                ActivityBuilder::new(
                    "inner",
                    Behavior::EmbeddedSubprocess { initial: "a".into() },
                )
                .scope()
                .in_scope("outer"),
            )
            .activity(ActivityBuilder::new("a", Behavior::End).in_scope("inner"))
            .initial("outer")
            .build()
            .unwrap();

        assert_eq!(
            graph.flow_scope_chain("a").unwrap(),
            vec!["inner".to_string(), "outer".to_string()]
        );
        assert!(graph.flow_scope_chain("outer").unwrap().is_empty());
    }
}
