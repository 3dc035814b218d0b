//! Structural validation of a built [`ProcessGraph`].

use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};

use super::types::Behavior;
use super::ProcessGraph;

/// Validate the structural integrity of a graph. Called once from the
/// builder; a graph that fails here is never handed to the engine.
pub(crate) fn validate_graph(graph: &ProcessGraph) -> EngineResult<()> {
    match graph.activity(&graph.initial) {
        Err(_) => return fail(format!("initial activity {} does not exist", graph.initial)),
        // the root execution starts directly at the initial activity; a
        // nested one would skip the scope entry of its enclosing scopes
        Ok(initial) if initial.parent_scope.is_some() => {
            return fail(format!(
                "initial activity {} must be top-level",
                graph.initial
            ))
        }
        Ok(_) => {}
    }

    for activity in graph.graph.node_weights() {
        if let Some(scope_id) = &activity.parent_scope {
            let scope = graph
                .activity(scope_id)
                .map_err(|_| validation(format!("{}: unknown parent scope {}", activity.id, scope_id)))?;
            if !scope.is_scope {
                return fail(format!(
                    "{}: parent scope {} is not a scope activity",
                    activity.id, scope_id
                ));
            }
        }

        match &activity.behavior {
            Behavior::EmbeddedSubprocess { initial } => {
                if !activity.is_scope {
                    return fail(format!("{}: subprocess must be a scope", activity.id));
                }
                let inner = graph.activity(initial).map_err(|_| {
                    validation(format!("{}: unknown initial activity {}", activity.id, initial))
                })?;
                if inner.parent_scope.as_deref() != Some(activity.id.as_str()) {
                    return fail(format!(
                        "{}: initial activity {} is not nested in it",
                        activity.id, initial
                    ));
                }
            }
            Behavior::Timer { delay_ms, repeat } => {
                if *delay_ms < 0 || matches!(repeat, Some(r) if *r <= 0) {
                    return fail(format!("{}: timer durations must be positive", activity.id));
                }
            }
            Behavior::CallActivity { process_key } => {
                if process_key.is_empty() {
                    return fail(format!("{}: empty call activity target", activity.id));
                }
            }
            _ => {}
        }

        for handler in &activity.error_handlers {
            if !activity.is_scope {
                return fail(format!(
                    "{}: error handlers require a scope activity",
                    activity.id
                ));
            }
            if graph.activity(&handler.handler).is_err() {
                return fail(format!(
                    "{}: unknown error handler target {}",
                    activity.id, handler.handler
                ));
            }
        }
    }

    for handler in &graph.error_handlers {
        if graph.activity(&handler.handler).is_err() {
            return fail(format!(
                "process-level error handler targets unknown activity {}",
                handler.handler
            ));
        }
    }

    // A transition may enter scopes but never leave one: a scope is left
    // by completing it, not by a transition of its content.
    for transition in graph.graph.edge_weights() {
        let source = graph.activity(&transition.source)?;
        if let Some(source_scope) = &source.parent_scope {
            let destination_chain = graph.flow_scope_chain(&transition.destination)?;
            if !destination_chain.iter().any(|scope| scope == source_scope) {
                return fail(format!(
                    "transition {} leaves scope {}",
                    transition.id, source_scope
                ));
            }
        }
    }

    // Scope nesting must be acyclic; transitions may loop freely.
    for activity in graph.graph.node_weights() {
        let mut seen = HashSet::new();
        let mut current = activity.parent_scope.clone();
        while let Some(scope_id) = current {
            if !seen.insert(scope_id.clone()) {
                return fail(format!("cyclic scope nesting at {}", scope_id));
            }
            current = graph
                .activity(&scope_id)
                .map_err(|_| validation(format!("unknown scope {}", scope_id)))?
                .parent_scope
                .clone();
        }
    }

    Ok(())
}

fn validation(message: String) -> EngineError {
    EngineError::GraphValidation(message)
}

fn fail(message: String) -> EngineResult<()> {
    Err(validation(message))
}

#[cfg(test)]
mod tests {
    use super::super::{ActivityBuilder, ProcessGraph};
    use super::*;

    #[test]
    fn test_parent_scope_must_be_scope() {
        let err = ProcessGraph::builder("p")
            .activity(ActivityBuilder::new("plain", Behavior::Automatic))
            .activity(ActivityBuilder::new("a", Behavior::End).in_scope("plain"))
            .initial("plain")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("is not a scope activity"));
    }

    #[test]
    fn test_initial_activity_must_be_top_level() {
        let err = ProcessGraph::builder("p")
            .activity(
                ActivityBuilder::new(
                    "sub",
                    Behavior::EmbeddedSubprocess { initial: "a".into() },
                )
                .scope(),
            )
            .activity(ActivityBuilder::new("a", Behavior::End).in_scope("sub"))
            .initial("a")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("must be top-level"));
    }

    #[test]
    fn test_subprocess_initial_must_be_nested() {
        let err = ProcessGraph::builder("p")
            .activity(
                ActivityBuilder::new(
                    "sub",
                    Behavior::EmbeddedSubprocess { initial: "a".into() },
                )
                .scope(),
            )
            .activity(ActivityBuilder::new("a", Behavior::End))
            .initial("sub")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("is not nested in it"));
    }

    #[test]
    fn test_transition_may_not_leave_a_scope() {
        let err = ProcessGraph::builder("p")
            .activity(
                ActivityBuilder::new(
                    "sub",
                    Behavior::EmbeddedSubprocess { initial: "a".into() },
                )
                .scope(),
            )
            .activity(ActivityBuilder::new("a", Behavior::Wait).in_scope("sub"))
            .activity(ActivityBuilder::new("outside", Behavior::End))
            .transition("t1", "a", "outside")
            .initial("sub")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("leaves scope sub"));
    }

    #[test]
    fn test_error_handler_target_must_exist() {
        let err = ProcessGraph::builder("p")
            .activity(
                ActivityBuilder::new(
                    "sub",
                    Behavior::EmbeddedSubprocess { initial: "a".into() },
                )
                .scope()
                .error_handler(Some("boom"), "missing"),
            )
            .activity(ActivityBuilder::new("a", Behavior::End).in_scope("sub"))
            .initial("sub")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown error handler target"));
    }
}
