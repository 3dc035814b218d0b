//! Instance modification: instantiate activities or transitions inside a
//! running instance, and cancel activity instances.
//!
//! The instantiation commands derive the chain of not-yet-instantiated flow
//! scopes between the target and the nearest instantiated ancestor scope,
//! validate for ambiguity before touching the tree, then graft a concurrent
//! branch carrying the chain and hand it to the interpreter.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::tree::project;

use super::mapping::ActivityExecutionMapping;
use super::operations::{AtomicOperation, OperationEngine, Resume, RunArtifacts};

enum Target {
    Activity(String),
    Transition(String),
}

impl Target {
    fn describe(&self) -> String {
        match self {
            Target::Activity(id) => format!("activity {id}"),
            Target::Transition(id) => format!("transition {id}"),
        }
    }
}

/// Instantiate `activity_id` as if the process had just arrived at it.
pub fn start_before_activity(
    engine: OperationEngine<'_>,
    activity_id: &str,
    variables: HashMap<String, Value>,
    variables_local: HashMap<String, Value>,
) -> EngineResult<RunArtifacts> {
    let flow_scope = engine.graph.activity(activity_id)?.parent_scope.clone();
    instantiate(
        engine,
        Target::Activity(activity_id.to_string()),
        flow_scope,
        variables,
        variables_local,
    )
}

/// Instantiate the default outgoing transition of `activity_id`, i.e.
/// continue as if the activity had just completed.
pub fn start_after_activity(
    engine: OperationEngine<'_>,
    activity_id: &str,
    variables: HashMap<String, Value>,
    variables_local: HashMap<String, Value>,
) -> EngineResult<RunArtifacts> {
    engine.graph.activity(activity_id)?;
    let transition_id = engine
        .graph
        .default_outgoing(activity_id)
        .ok_or_else(|| {
            EngineError::UnsupportedInstantiationTarget(format!(
                "activity {activity_id} has no outgoing transition to start after"
            ))
        })?
        .to_string();
    start_transition(engine, &transition_id, variables, variables_local)
}

/// Instantiate a specific transition.
pub fn start_transition(
    engine: OperationEngine<'_>,
    transition_id: &str,
    variables: HashMap<String, Value>,
    variables_local: HashMap<String, Value>,
) -> EngineResult<RunArtifacts> {
    let source = engine.graph.transition(transition_id)?.source.clone();
    let flow_scope = engine.graph.activity(&source)?.parent_scope.clone();
    instantiate(
        engine,
        Target::Transition(transition_id.to_string()),
        flow_scope,
        variables,
        variables_local,
    )
}

fn instantiate(
    mut engine: OperationEngine<'_>,
    target: Target,
    target_flow_scope: Option<String>,
    variables: HashMap<String, Value>,
    variables_local: HashMap<String, Value>,
) -> EngineResult<RunArtifacts> {
    let mapping = ActivityExecutionMapping::build(engine.tree)?;

    // Walk up from the target's flow scope until an instantiated scope is
    // found, collecting the scopes that must be freshly entered.
    let mut to_instantiate: Vec<String> = Vec::new();
    let mut flow_scope = target_flow_scope;
    let scope_execution = loop {
        let executions = mapping.executions(flow_scope.as_deref());
        match executions {
            [] => {
                let scope_activity = flow_scope.ok_or_else(|| {
                    EngineError::Internal("process instance has no root execution".into())
                })?;
                flow_scope = engine.graph.activity(&scope_activity)?.parent_scope.clone();
                to_instantiate.push(scope_activity);
            }
            [single] => break *single,
            _ => {
                return Err(EngineError::AmbiguousExecution(
                    flow_scope.unwrap_or_else(|| target.describe()),
                ))
            }
        }
    };
    to_instantiate.reverse();

    // A cancelling or interrupting top-most activity takes down its host
    // scope's content before anything new starts. Validate first; nothing
    // is mutated before all checks pass.
    let topmost = to_instantiate.first().cloned().or(match &target {
        Target::Activity(id) => Some(id.clone()),
        Target::Transition(_) => None,
    });
    let mut interrupting = false;
    if let Some(topmost) = &topmost {
        let activity = engine.graph.activity(topmost)?;
        if activity.is_cancel_scope || activity.is_interrupt_scope {
            let host_scope = activity.parent_scope.clone();
            let hosts = mapping.executions(host_scope.as_deref());
            if hosts.len() > 1 {
                return Err(EngineError::AmbiguousExecution(topmost.clone()));
            }
            interrupting = !hosts.is_empty();
        }
    }

    if interrupting {
        let reason = format!("instantiation of {}", target.describe());

        // When the cancelling activity is the target itself, the whole
        // command is one cancel-scope/interrupt-scope operation.
        if to_instantiate.is_empty() {
            if let Target::Activity(activity_id) = &target {
                for (name, value) in variables {
                    engine.tree.set_variable(scope_execution, name, value)?;
                }
                for (name, value) in variables_local {
                    engine.tree.set_variable_local(scope_execution, name, value)?;
                }
                let operation = if engine.graph.activity(activity_id)?.is_cancel_scope {
                    AtomicOperation::CancelScope {
                        activity: activity_id.clone(),
                        reason,
                    }
                } else {
                    AtomicOperation::InterruptScope {
                        activity: activity_id.clone(),
                        resume: Resume::Execute,
                        reason,
                    }
                };
                engine.push(scope_execution, operation);
                return engine.drain();
            }
        }

        // The cancelling activity sits somewhere above the target: clear
        // the host scope's content, then graft the chain onto it.
        engine.remove_children_and_notify(scope_execution, &reason)?;
        let host = engine.tree.get_mut(scope_execution)?;
        host.activity = None;
        host.transition = None;
        host.is_active = true;
    }

    // The new branch joins the scope execution concurrently unless the
    // scope is idle (freshly interrupted or never started), in which case
    // the scope execution itself carries the chain.
    let idle = {
        let host = engine.tree.get(scope_execution)?;
        host.children.is_empty() && host.activity.is_none() && host.transition.is_none()
    };
    let mut cursor = if idle {
        scope_execution
    } else {
        engine.create_concurrent(scope_execution)?
    };
    for scope_activity in &to_instantiate {
        cursor = engine.tree.create_scope_child(cursor, scope_activity.clone())?;
    }
    if let Target::Activity(activity_id) = &target {
        if engine.graph.activity(activity_id)?.is_scope {
            cursor = engine.tree.create_scope_child(cursor, activity_id.clone())?;
        }
    }

    // Variables bind before the first activity of the branch runs.
    for (name, value) in variables {
        engine.tree.set_variable(cursor, name, value)?;
    }
    for (name, value) in variables_local {
        engine.tree.set_variable_local(cursor, name, value)?;
    }

    match target {
        Target::Activity(activity_id) => {
            {
                let execution = engine.tree.get_mut(cursor)?;
                execution.activity = Some(activity_id);
                execution.is_active = true;
            }
            engine.push(cursor, AtomicOperation::ExecuteActivity { from_job: false });
        }
        Target::Transition(transition_id) => {
            {
                let execution = engine.tree.get_mut(cursor)?;
                execution.transition = Some(transition_id);
                execution.is_active = true;
            }
            engine.push(cursor, AtomicOperation::TransitionNotifyListenerTake);
        }
    }
    engine.drain()
}

/// Cancel one activity instance by id.
///
/// The backing execution is walked upward to the highest execution that
/// can be removed as a single cascading unit: the walk stops at concurrent
/// executions, at executions whose parent has other children and at
/// parents that carry in-flight state of their own. The process instance
/// root is reset in place, never deleted.
pub fn cancel_activity_instance(
    mut engine: OperationEngine<'_>,
    instance_id: &str,
) -> EngineResult<RunArtifacts> {
    let projection = project(engine.tree)?;
    let instance = projection
        .find(instance_id)
        .ok_or_else(|| EngineError::ActivityInstanceNotFound(instance_id.to_string()))?;
    if instance.execution_ids.len() != 1 {
        return Err(EngineError::AmbiguousActivityInstance {
            instance_id: instance_id.to_string(),
            found: instance.execution_ids.len(),
        });
    }
    let backing = instance.execution_ids[0];
    let root = engine.tree.root();

    let mut topmost = backing;
    while topmost != root {
        if engine.tree.get(topmost)?.is_concurrent {
            break;
        }
        let parent = engine
            .tree
            .parent(topmost)?
            .ok_or_else(|| EngineError::Internal("non-root execution without parent".into()))?;
        if engine.tree.non_event_children(parent)?.len() > 1 {
            break;
        }
        let parent_execution = engine.tree.get(parent)?;
        if parent_execution.activity.is_some() || parent_execution.transition.is_some() {
            break;
        }
        topmost = parent;
    }

    let reason = format!("activity instance {instance_id} cancelled");
    if topmost == root {
        engine.remove_children_and_notify(root, &reason)?;
        let execution = engine.tree.get_mut(root)?;
        execution.activity = None;
        execution.transition = None;
        execution.is_active = true;
    } else {
        let parent = engine
            .tree
            .parent(topmost)?
            .ok_or_else(|| EngineError::Internal("non-root execution without parent".into()))?;
        engine.remove_and_notify(topmost, &reason)?;
        engine.tree.compact(parent)?;
    }
    engine.drain()
}
