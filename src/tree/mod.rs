//! Runtime execution tree of one process instance.
//!
//! The tree is an arena of [`Execution`] records addressed by stable
//! [`ExecutionId`]s; parent/child relations are id lookups through the
//! arena, never owning back-pointers. All structural surgery (cascade
//! removal, compacted-tree replacement, concurrency merge) lives here, so
//! the operation interpreter in [`crate::engine`] only ever manipulates the
//! tree through invariant-preserving primitives.

mod projection;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

pub use projection::{project, ActivityInstance};

/// Stable identifier of one execution within its tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ExecutionId(u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Cross-instance link from the root of a called instance back to the
/// call-activity execution in the calling instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperLink {
    pub process_instance_id: String,
    pub execution_id: ExecutionId,
}

/// One runtime token of control flow.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: ExecutionId,
    pub parent: Option<ExecutionId>,
    pub children: Vec<ExecutionId>,

    /// Activity the execution is currently positioned at.
    pub activity: Option<String>,
    /// Transition currently being taken.
    pub transition: Option<String>,

    pub is_scope: bool,
    pub is_concurrent: bool,
    pub is_active: bool,
    pub is_event_scope: bool,

    /// For a scope execution: the scope activity it realizes. `None` on the
    /// root (process scope) and on non-scope executions.
    pub scope_activity: Option<String>,

    /// Variables bound at this execution's level.
    pub variables: HashMap<String, Value>,

    /// Set on the root of a called sub instance.
    pub super_execution: Option<SuperLink>,
}

impl Execution {
    fn new(id: ExecutionId, parent: Option<ExecutionId>) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            activity: None,
            transition: None,
            is_scope: false,
            is_concurrent: false,
            is_active: true,
            is_event_scope: false,
            scope_activity: None,
            variables: HashMap::new(),
            super_execution: None,
        }
    }
}

/// The mutable runtime state of one process instance.
#[derive(Debug)]
pub struct ExecutionTree {
    executions: HashMap<ExecutionId, Execution>,
    next_id: u64,
    root: ExecutionId,
    pub process_instance_id: String,
    pub ended: bool,
}

impl ExecutionTree {
    /// Create a tree containing only the root execution (the process
    /// instance itself: a parentless scope execution).
    pub fn new(process_instance_id: impl Into<String>) -> Self {
        let root = ExecutionId(0);
        let mut root_execution = Execution::new(root, None);
        root_execution.is_scope = true;
        let mut executions = HashMap::new();
        executions.insert(root, root_execution);
        Self {
            executions,
            next_id: 1,
            root,
            process_instance_id: process_instance_id.into(),
            ended: false,
        }
    }

    pub fn root(&self) -> ExecutionId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.executions.contains_key(&id)
    }

    pub fn get(&self, id: ExecutionId) -> EngineResult<&Execution> {
        self.executions
            .get(&id)
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))
    }

    pub fn get_mut(&mut self, id: ExecutionId) -> EngineResult<&mut Execution> {
        self.executions
            .get_mut(&id)
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))
    }

    pub fn parent(&self, id: ExecutionId) -> EngineResult<Option<ExecutionId>> {
        Ok(self.get(id)?.parent)
    }

    /// IDs of all executions, in arbitrary order.
    pub fn ids(&self) -> impl Iterator<Item = ExecutionId> + '_ {
        self.executions.keys().copied()
    }

    /// Children of `id` that are not event-scope executions. Event scopes
    /// stay under their original parent and never participate in the
    /// concurrency structure.
    pub fn non_event_children(&self, id: ExecutionId) -> EngineResult<Vec<ExecutionId>> {
        let execution = self.get(id)?;
        let mut out = Vec::with_capacity(execution.children.len());
        for child in &execution.children {
            if !self.get(*child)?.is_event_scope {
                out.push(*child);
            }
        }
        Ok(out)
    }

    /// Create a plain child execution under `parent`.
    pub fn create_child(&mut self, parent: ExecutionId) -> EngineResult<ExecutionId> {
        if !self.contains(parent) {
            return Err(EngineError::ExecutionNotFound(parent.to_string()));
        }
        let id = ExecutionId(self.next_id);
        self.next_id += 1;
        let execution = Execution::new(id, Some(parent));
        self.executions.insert(id, execution);
        self.get_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Create a scope execution under `parent`, realizing `scope_activity`.
    pub fn create_scope_child(
        &mut self,
        parent: ExecutionId,
        scope_activity: impl Into<String>,
    ) -> EngineResult<ExecutionId> {
        let id = self.create_child(parent)?;
        let execution = self.get_mut(id)?;
        execution.is_scope = true;
        execution.scope_activity = Some(scope_activity.into());
        Ok(id)
    }

    /// Create a concurrent, non-scope child execution under `parent`.
    pub fn create_concurrent_child(&mut self, parent: ExecutionId) -> EngineResult<ExecutionId> {
        let id = self.create_child(parent)?;
        let execution = self.get_mut(id)?;
        execution.is_concurrent = true;
        Ok(id)
    }

    /// Move `id` (with its subtree) under a new parent.
    pub fn reparent(&mut self, id: ExecutionId, new_parent: ExecutionId) -> EngineResult<()> {
        if !self.contains(new_parent) {
            return Err(EngineError::ExecutionNotFound(new_parent.to_string()));
        }
        self.detach(id)?;
        self.get_mut(id)?.parent = Some(new_parent);
        self.get_mut(new_parent)?.children.push(id);
        Ok(())
    }

    /// Detach `id` from its parent's child list.
    fn detach(&mut self, id: ExecutionId) -> EngineResult<()> {
        if let Some(parent) = self.get(id)?.parent {
            self.get_mut(parent)?.children.retain(|c| *c != id);
        }
        Ok(())
    }

    /// Remove `id` and, recursively, all of its descendants. Returns the
    /// removed executions bottom-up so callers can fire end notifications.
    pub fn remove_cascade(
        &mut self,
        id: ExecutionId,
        reason: &str,
    ) -> EngineResult<Vec<Execution>> {
        self.detach(id)?;
        let mut removed = Vec::new();
        self.remove_subtree(id, reason, &mut removed)?;
        Ok(removed)
    }

    fn remove_subtree(
        &mut self,
        id: ExecutionId,
        reason: &str,
        removed: &mut Vec<Execution>,
    ) -> EngineResult<()> {
        let children = self.get(id)?.children.clone();
        for child in children {
            self.remove_subtree(child, reason, removed)?;
        }
        let execution = self
            .executions
            .remove(&id)
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))?;
        debug!(execution = %id, activity = ?execution.activity, reason, "removing execution");
        removed.push(execution);
        Ok(())
    }

    /// Remove all children of `id` (cascading), leaving `id` itself in
    /// place. Used for interrupting and for resetting the root, which is
    /// never deleted.
    pub fn remove_children_cascade(
        &mut self,
        id: ExecutionId,
        reason: &str,
    ) -> EngineResult<Vec<Execution>> {
        let children = self.get(id)?.children.clone();
        let mut removed = Vec::new();
        for child in children {
            removed.extend(self.remove_cascade(child, reason)?);
        }
        Ok(removed)
    }

    /// Move the run state (activity, transition, active flag) from `from`
    /// onto `to`. Used when a scope execution is destroyed and its parent
    /// continues in its place, and when a compacted tree is expanded.
    pub fn transfer_state(&mut self, from: ExecutionId, to: ExecutionId) -> EngineResult<()> {
        let (activity, transition, is_active) = {
            let source = self.get_mut(from)?;
            (
                source.activity.take(),
                source.transition.take(),
                source.is_active,
            )
        };
        let target = self.get_mut(to)?;
        target.activity = activity;
        target.transition = transition;
        target.is_active = is_active;
        Ok(())
    }

    /// Merge a single remaining concurrent branch back into its parent
    /// scope execution: the structural inverse of creating a concurrent
    /// execution. No-op unless `scope` has exactly one non-event child and
    /// that child is concurrent.
    pub fn compact(&mut self, scope: ExecutionId) -> EngineResult<()> {
        let children = self.non_event_children(scope)?;
        if children.len() != 1 {
            return Ok(());
        }
        let child = children[0];
        let (is_concurrent, is_scope) = {
            let c = self.get(child)?;
            (c.is_concurrent, c.is_scope)
        };
        if !is_concurrent {
            return Ok(());
        }

        if is_scope {
            // A concurrent scope execution keeps its subtree; it simply
            // stops being concurrent.
            self.get_mut(child)?.is_concurrent = false;
            return Ok(());
        }

        let grandchildren = self.get(child)?.children.clone();
        if grandchildren.is_empty() {
            // Leaf branch: the scope execution becomes the carrier again.
            self.transfer_state(child, scope)?;
            let variables = std::mem::take(&mut self.get_mut(child)?.variables);
            self.get_mut(scope)?.variables.extend(variables);
            self.detach(child)?;
            self.executions.remove(&child);
        } else {
            // Anchor branch: its children move up one level.
            for grandchild in &grandchildren {
                self.get_mut(*grandchild)?.parent = Some(scope);
            }
            self.get_mut(scope)?.children.extend(grandchildren);
            self.detach(child)?;
            self.executions.remove(&child);
        }
        debug!(scope = %scope, "merged single remaining branch into scope execution");
        Ok(())
    }

    /// Variable lookup walking the parent chain.
    pub fn variable(&self, id: ExecutionId, name: &str) -> EngineResult<Option<Value>> {
        let mut current = Some(id);
        while let Some(cursor) = current {
            let execution = self.get(cursor)?;
            if let Some(value) = execution.variables.get(name) {
                return Ok(Some(value.clone()));
            }
            current = execution.parent;
        }
        Ok(None)
    }

    /// Bind a variable at the nearest enclosing execution that already
    /// holds it, else at the root.
    pub fn set_variable(
        &mut self,
        id: ExecutionId,
        name: impl Into<String>,
        value: Value,
    ) -> EngineResult<()> {
        let name = name.into();
        let mut current = Some(id);
        while let Some(cursor) = current {
            let execution = self.get(cursor)?;
            if execution.variables.contains_key(&name) {
                self.get_mut(cursor)?.variables.insert(name, value);
                return Ok(());
            }
            current = execution.parent;
        }
        self.get_mut(self.root)?.variables.insert(name, value);
        Ok(())
    }

    /// Bind a variable at the execution itself.
    pub fn set_variable_local(
        &mut self,
        id: ExecutionId,
        name: impl Into<String>,
        value: Value,
    ) -> EngineResult<()> {
        self.get_mut(id)?.variables.insert(name.into(), value);
        Ok(())
    }

    /// Check the structural invariants that must hold between atomic
    /// operations. Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let root = self
            .executions
            .get(&self.root)
            .ok_or_else(|| "root execution missing".to_string())?;
        if root.parent.is_some() {
            return Err("root has a parent".into());
        }
        if !root.is_scope {
            return Err("root is not a scope".into());
        }

        // Parent/child agreement, reachability and invariants 2 and 3.
        let mut reachable = 0usize;
        let mut stack = vec![self.root];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                return Err(format!("{id} reachable twice (cycle or shared child)"));
            }
            reachable += 1;
            let execution = self
                .executions
                .get(&id)
                .ok_or_else(|| format!("{id} referenced but missing"))?;
            if execution.is_concurrent {
                let parent = execution
                    .parent
                    .ok_or_else(|| format!("{id} concurrent without parent"))?;
                let parent_execution = self
                    .executions
                    .get(&parent)
                    .ok_or_else(|| format!("{id}: parent {parent} missing"))?;
                if !parent_execution.is_scope {
                    return Err(format!("{id} concurrent under non-scope parent {parent}"));
                }
            }
            let mut scopes_seen: Vec<&str> = Vec::new();
            for child in &execution.children {
                let child_execution = self
                    .executions
                    .get(child)
                    .ok_or_else(|| format!("{id}: child {child} missing"))?;
                if child_execution.parent != Some(id) {
                    return Err(format!("{child} does not point back to parent {id}"));
                }
                if let Some(scope) = child_execution.scope_activity.as_deref() {
                    if !child_execution.is_event_scope {
                        if scopes_seen.contains(&scope) {
                            return Err(format!(
                                "two sibling scope executions realize scope {scope}"
                            ));
                        }
                        scopes_seen.push(scope);
                    }
                }
                stack.push(*child);
            }
        }
        if reachable != self.executions.len() {
            return Err(format!(
                "{} executions orphaned",
                self.executions.len() - reachable
            ));
        }
        Ok(())
    }
}
