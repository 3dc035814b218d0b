//! The atomic-operation interpreter.
//!
//! [`OperationEngine`] drains an explicit work-list (a stack) of
//! `(execution, operation)` pairs against one [`ExecutionTree`] until the
//! tree reaches a stable wait state or the instance ends. Every operation
//! runs to completion synchronously; suspension happens only by creating a
//! [`Job`] and leaving the tree in an invariant-satisfying state. The
//! work-list bounds call-stack depth independently of tree size.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::{EngineError, EngineResult};
use crate::graph::{Behavior, ProcessGraph};
use crate::job::Job;
use crate::tree::{ExecutionId, ExecutionTree, SuperLink};

use super::{EngineConfig, ExecutionEvent, ExecutionListener};

/// What the continuation execution does after a scope was cancelled or
/// interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    Execute,
    End,
}

/// The fixed vocabulary of atomic operations.
#[derive(Debug, Clone)]
pub enum AtomicOperation {
    /// Invoke the current activity's behavior.
    ExecuteActivity { from_job: bool },
    /// First step of the take sequence: fire "take" listeners.
    TransitionNotifyListenerTake,
    /// Second step: destroy scope executions the destination lies outside
    /// of.
    TransitionDestroyScope,
    /// Third step: create the scope executions required to enter the
    /// destination's nesting level.
    TransitionCreateScope,
    /// Graft a new concurrent sibling taking `transition` under a scope
    /// execution.
    CreateConcurrentExecution { transition: String },
    /// Cancel the scope owned by this scope execution; the continuation
    /// adopts `activity`.
    CancelScope { activity: String, reason: String },
    /// Interrupt the owning scope; the continuation adopts `activity`.
    InterruptScope {
        activity: String,
        resume: Resume,
        reason: String,
    },
    /// Terminate a leaf; merges concurrency back when it became
    /// unnecessary.
    EndExecution,
}

/// A request to start a sub process instance for a call activity.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub process_key: String,
    pub super_execution: ExecutionId,
}

/// A declared error that found no handler locally and must continue in the
/// calling process instance.
#[derive(Debug, Clone)]
pub struct Escalation {
    pub link: SuperLink,
    pub code: String,
}

/// Everything a drained command produced besides tree mutation. The caller
/// (the [`ProcessEngine`](super::ProcessEngine)) persists jobs, starts
/// requested sub instances and continues cross-instance propagation after
/// the instance lock is released.
#[derive(Debug, Default)]
pub struct RunArtifacts {
    pub jobs: Vec<Job>,
    pub spawns: Vec<SpawnRequest>,
    pub escalation: Option<Escalation>,
    pub completed: bool,
}

/// Interprets atomic operations against one execution tree.
///
/// One engine is created per logical transaction (external trigger, job
/// execution, modification command) and consumed by a single entry point.
pub struct OperationEngine<'a> {
    pub(crate) graph: &'a ProcessGraph,
    pub(crate) tree: &'a mut ExecutionTree,
    listeners: &'a [Arc<dyn ExecutionListener>],
    config: &'a EngineConfig,
    work_list: Vec<(ExecutionId, AtomicOperation)>,
    artifacts: RunArtifacts,
}

impl<'a> OperationEngine<'a> {
    pub fn new(
        graph: &'a ProcessGraph,
        tree: &'a mut ExecutionTree,
        listeners: &'a [Arc<dyn ExecutionListener>],
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            graph,
            tree,
            listeners,
            config,
            work_list: Vec::new(),
            artifacts: RunArtifacts::default(),
        }
    }

    // ------------------------------------------------------------------
    // Entry points (one per logical transaction)
    // ------------------------------------------------------------------

    /// Position the tree at the initial activity and execute it.
    pub fn start(mut self) -> EngineResult<RunArtifacts> {
        let root = self.tree.root();
        let initial = self.graph.initial.clone();
        let carrier = if self.graph.activity(&initial)?.is_scope {
            self.tree.create_scope_child(root, initial.clone())?
        } else {
            root
        };
        self.tree.get_mut(carrier)?.activity = Some(initial);
        self.push(carrier, AtomicOperation::ExecuteActivity { from_job: false });
        self.drain()
    }

    /// Run one operation (and its follow-ups) to quiescence.
    pub fn run(
        mut self,
        execution: ExecutionId,
        operation: AtomicOperation,
    ) -> EngineResult<RunArtifacts> {
        self.push(execution, operation);
        self.drain()
    }

    /// Deliver a signal to a waiting execution: bind the payload, then
    /// leave the current activity.
    pub fn signal(
        mut self,
        execution: ExecutionId,
        data: HashMap<String, Value>,
    ) -> EngineResult<RunArtifacts> {
        let activity_id = self.tree.get(execution)?.activity.clone().ok_or_else(|| {
            EngineError::NotSignallable {
                execution: execution.to_string(),
                activity: None,
            }
        })?;
        let behavior = self.graph.activity(&activity_id)?.behavior.clone();
        if !matches!(
            behavior,
            Behavior::Wait | Behavior::Timer { .. } | Behavior::CallActivity { .. }
        ) {
            return Err(EngineError::NotSignallable {
                execution: execution.to_string(),
                activity: Some(activity_id),
            });
        }
        for (name, value) in data {
            self.tree.set_variable(execution, name, value)?;
        }
        self.leave(execution)?;
        self.drain()
    }

    /// Raise a declared process error at an execution.
    pub fn propagate_error(
        mut self,
        execution: ExecutionId,
        code: &str,
    ) -> EngineResult<RunArtifacts> {
        self.raise_error(execution, code)?;
        self.drain()
    }

    /// Cancel the scope owning `execution` (external trigger). The root
    /// scope is reset in place, never deleted.
    pub fn cancel_scope(
        mut self,
        execution: ExecutionId,
        reason: &str,
    ) -> EngineResult<RunArtifacts> {
        let scope = self.scope_ancestor(execution)?;
        if scope == self.tree.root() {
            self.remove_children_and_notify(scope, reason)?;
            let root = self.tree.get_mut(scope)?;
            root.activity = None;
            root.transition = None;
            self.finish_instance()?;
        } else {
            let parent = self
                .tree
                .parent(scope)?
                .ok_or_else(|| EngineError::Internal("scope execution without parent".into()))?;
            self.remove_and_notify(scope, reason)?;
            self.branch_ended(parent)?;
        }
        self.drain()
    }

    /// Interrupt the scope owning `execution` (external trigger): all
    /// children of the owning scope execution are cancelled; the scope
    /// execution itself survives without an activity.
    pub fn interrupt_scope(
        mut self,
        execution: ExecutionId,
        reason: &str,
    ) -> EngineResult<RunArtifacts> {
        let scope = self.scope_ancestor(execution)?;
        self.remove_children_and_notify(scope, reason)?;
        let scope_execution = self.tree.get_mut(scope)?;
        scope_execution.activity = None;
        scope_execution.transition = None;
        scope_execution.is_active = true;
        self.drain()
    }

    // ------------------------------------------------------------------
    // Work-list driver
    // ------------------------------------------------------------------

    pub(crate) fn push(&mut self, execution: ExecutionId, operation: AtomicOperation) {
        self.work_list.push((execution, operation));
    }

    pub(crate) fn drain(mut self) -> EngineResult<RunArtifacts> {
        let mut steps = 0usize;
        while let Some((execution, operation)) = self.work_list.pop() {
            steps += 1;
            if steps > self.config.max_operations {
                return Err(EngineError::MaxOperationsExceeded(self.config.max_operations));
            }
            if !self.tree.contains(execution) {
                // The target was pruned by an earlier operation in this
                // transaction (join pruning, interruption).
                continue;
            }
            trace!(execution = %execution, operation = ?operation, "performing atomic operation");
            self.dispatch(execution, operation)?;
            debug_assert_eq!(self.tree.check_invariants(), Ok(()));
        }
        Ok(self.artifacts)
    }

    fn dispatch(&mut self, execution: ExecutionId, operation: AtomicOperation) -> EngineResult<()> {
        match operation {
            AtomicOperation::ExecuteActivity { from_job } => {
                self.execute_activity(execution, from_job)
            }
            AtomicOperation::TransitionNotifyListenerTake => self.take(execution),
            AtomicOperation::TransitionDestroyScope => self.destroy_scope(execution),
            AtomicOperation::TransitionCreateScope => self.create_scope(execution),
            AtomicOperation::CreateConcurrentExecution { transition } => {
                let branch = self.create_concurrent(execution)?;
                self.tree.get_mut(branch)?.transition = Some(transition);
                self.push(branch, AtomicOperation::TransitionNotifyListenerTake);
                Ok(())
            }
            AtomicOperation::CancelScope { activity, reason } => {
                self.cancel_scope_operation(execution, &activity, &reason)
            }
            AtomicOperation::InterruptScope {
                activity,
                resume,
                reason,
            } => self.interrupt_scope_operation(execution, &activity, resume, &reason),
            AtomicOperation::EndExecution => self.end_execution(execution),
        }
    }

    // ------------------------------------------------------------------
    // execute-activity
    // ------------------------------------------------------------------

    fn execute_activity(&mut self, execution: ExecutionId, from_job: bool) -> EngineResult<()> {
        let activity_id = self
            .tree
            .get(execution)?
            .activity
            .clone()
            .ok_or_else(|| EngineError::Internal(format!("{execution}: execute without activity")))?;
        let activity = self.graph.activity(&activity_id)?.clone();

        if activity.is_async && !from_job {
            // Crossing a transaction boundary: persist a continuation and
            // leave the tree in a stable wait state.
            debug!(execution = %execution, activity = %activity_id, "deferring activity via job");
            self.artifacts.jobs.push(Job::continuation(
                &self.tree.process_instance_id,
                execution,
                format!("{}:{}", self.graph.key, activity_id),
                activity.job_priority,
                self.graph.default_job_retries,
            ));
            return Ok(());
        }

        self.notify(ExecutionEvent::Start {
            process_instance_id: self.tree.process_instance_id.clone(),
            execution,
            activity: activity_id.clone(),
        });

        match activity.behavior {
            Behavior::Automatic | Behavior::EventSubprocessStart => self.leave(execution)?,
            Behavior::Wait => {}
            Behavior::Timer { delay_ms, repeat } => {
                self.artifacts.jobs.push(Job::timer(
                    &self.tree.process_instance_id,
                    execution,
                    format!("{}:{}", self.graph.key, activity_id),
                    Utc::now() + Duration::milliseconds(delay_ms),
                    repeat,
                    activity.job_priority,
                    self.graph.default_job_retries,
                ));
            }
            Behavior::ThrowError { code } => self.raise_error(execution, &code)?,
            Behavior::End => self.push(execution, AtomicOperation::EndExecution),
            Behavior::TerminateEnd => self.push(
                execution,
                AtomicOperation::InterruptScope {
                    activity: activity_id.clone(),
                    resume: Resume::End,
                    reason: format!("terminate end event {activity_id} reached"),
                },
            ),
            Behavior::ParallelFork => self.fork(execution, &activity_id)?,
            Behavior::ParallelJoin => self.join(execution, &activity_id)?,
            Behavior::EmbeddedSubprocess { initial } => {
                // The scope execution was created on entry; continue at the
                // initial activity inside the scope.
                self.tree.get_mut(execution)?.activity = Some(initial);
                self.push(execution, AtomicOperation::ExecuteActivity { from_job: false });
            }
            Behavior::CallActivity { process_key } => {
                self.artifacts.spawns.push(SpawnRequest {
                    process_key,
                    super_execution: execution,
                });
            }
        }
        Ok(())
    }

    /// Leave the current activity through its default outgoing transition,
    /// or end the execution when there is none.
    pub(crate) fn leave(&mut self, execution: ExecutionId) -> EngineResult<()> {
        let activity_id = self
            .tree
            .get(execution)?
            .activity
            .clone()
            .ok_or_else(|| EngineError::Internal(format!("{execution}: leave without activity")))?;
        match self.graph.default_outgoing(&activity_id) {
            Some(transition) => {
                let transition = transition.to_string();
                self.tree.get_mut(execution)?.transition = Some(transition);
                self.push(execution, AtomicOperation::TransitionNotifyListenerTake);
            }
            None => self.push(execution, AtomicOperation::EndExecution),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // take-transition sequence
    // ------------------------------------------------------------------

    fn take(&mut self, execution: ExecutionId) -> EngineResult<()> {
        let transition = self
            .tree
            .get(execution)?
            .transition
            .clone()
            .ok_or_else(|| EngineError::Internal(format!("{execution}: take without transition")))?;
        self.notify(ExecutionEvent::Take {
            process_instance_id: self.tree.process_instance_id.clone(),
            execution,
            transition,
        });
        self.push(execution, AtomicOperation::TransitionDestroyScope);
        Ok(())
    }

    fn destroy_scope(&mut self, execution: ExecutionId) -> EngineResult<()> {
        let transition_id = self.tree.get(execution)?.transition.clone().ok_or_else(|| {
            EngineError::Internal(format!("{execution}: destroy-scope without transition"))
        })?;
        let transition = self.graph.transition(&transition_id)?.clone();
        let source_is_scope = self.graph.activity(&transition.source)?.is_scope;

        // Calculate the propagating execution: leaving a scope activity
        // destroys its scope execution, and the parent continues in its
        // place.
        let propagating = if source_is_scope {
            let current = self.tree.get(execution)?;
            if current.is_concurrent {
                // A concurrent scope execution continues itself.
                self.remove_children_and_notify(execution, "scope destroyed")?;
                let current = self.tree.get_mut(execution)?;
                current.is_scope = false;
                current.scope_activity = None;
                execution
            } else {
                let parent = current.parent.ok_or_else(|| {
                    EngineError::Internal(format!("{execution}: scope execution without parent"))
                })?;
                debug!(scope = %execution, parent = %parent, "destroy scope: parent continues");
                self.tree.transfer_state(execution, parent)?;
                self.remove_and_notify(execution, "scope destroyed")?;
                parent
            }
        } else {
            execution
        };

        if self.graph.activity(&transition.destination)?.is_interrupt_scope {
            self.tree.get_mut(propagating)?.activity = None;
            self.push(
                propagating,
                AtomicOperation::InterruptScope {
                    activity: transition.destination.clone(),
                    resume: Resume::Execute,
                    reason: format!("interrupting activity {} entered", transition.destination),
                },
            );
        } else {
            self.push(propagating, AtomicOperation::TransitionCreateScope);
        }
        Ok(())
    }

    fn create_scope(&mut self, execution: ExecutionId) -> EngineResult<()> {
        let transition_id = self.tree.get(execution)?.transition.clone().ok_or_else(|| {
            EngineError::Internal(format!("{execution}: create-scope without transition"))
        })?;
        let destination = self.graph.transition(&transition_id)?.destination.clone();

        // Re-derive, before any mutation, the stack of destination scopes
        // lacking an execution below the carrier.
        let current_scope = self.scope_context(execution)?;
        let chain = self.graph.flow_scope_chain(&destination)?;
        let mut to_enter = Vec::new();
        let mut found_context = current_scope.is_none();
        for scope in &chain {
            if current_scope.as_deref() == Some(scope.as_str()) {
                found_context = true;
                break;
            }
            to_enter.push(scope.clone());
        }
        if !found_context {
            return Err(EngineError::Internal(format!(
                "transition {transition_id} leads outside the current scope"
            )));
        }
        to_enter.reverse();

        let mut carrier = execution;
        for scope in to_enter {
            carrier = self.tree.create_scope_child(carrier, scope)?;
        }
        if self.graph.activity(&destination)?.is_scope {
            carrier = self.tree.create_scope_child(carrier, destination.clone())?;
        }

        if carrier != execution {
            let anchor = self.tree.get_mut(execution)?;
            anchor.activity = None;
            anchor.transition = None;
        }
        let entering = self.tree.get_mut(carrier)?;
        entering.activity = Some(destination);
        entering.transition = None;
        entering.is_active = true;
        self.push(carrier, AtomicOperation::ExecuteActivity { from_job: false });
        Ok(())
    }

    // ------------------------------------------------------------------
    // create-concurrent-execution
    // ------------------------------------------------------------------

    /// Graft a new concurrent, non-scope execution under `scope`,
    /// preserving the concurrency invariants. Covers the three structural
    /// cases of a scope execution gaining a branch:
    ///
    /// 1. no children (compacted tree): a sibling execution takes over the
    ///    scope execution's in-flight state, then the new branch is added;
    /// 2. exactly one non-concurrent child: an inactive concurrent anchor
    ///    is inserted between the scope execution and that child;
    /// 3. two or more children: the new branch is simply appended.
    pub(crate) fn create_concurrent(&mut self, scope: ExecutionId) -> EngineResult<ExecutionId> {
        let children = self.tree.non_event_children(scope)?;

        if children.is_empty() {
            if self.tree.get(scope)?.activity.is_some() {
                // (1) compacted: the in-flight state moves onto a
                // replacing concurrent execution.
                let replacing = self.tree.create_concurrent_child(scope)?;
                self.tree.transfer_state(scope, replacing)?;
            }
        } else if children.len() == 1 {
            let child = children[0];
            if !self.tree.get(child)?.is_concurrent {
                // (2) single non-concurrent child: insert a concurrent
                // anchor above it.
                let anchor = self.tree.create_concurrent_child(scope)?;
                self.tree.get_mut(anchor)?.is_active = false;
                self.tree.reparent(child, anchor)?;
            }
        }
        // (3) (and the tail of 1 and 2): append the new branch.
        self.tree.create_concurrent_child(scope)
    }

    fn fork(&mut self, execution: ExecutionId, activity_id: &str) -> EngineResult<()> {
        let outgoing = self.graph.outgoing(activity_id).to_vec();
        if outgoing.is_empty() {
            self.push(execution, AtomicOperation::EndExecution);
            return Ok(());
        }

        let scope = self.scope_ancestor(execution)?;
        if execution == scope {
            // Compacted carrier: the scope execution fans out below itself.
            self.tree.get_mut(execution)?.activity = None;
        } else {
            // The arriving branch is consumed and replaced by the new ones.
            self.tree.remove_cascade(execution, "parallel split")?;
        }
        for transition in outgoing.into_iter().rev() {
            self.push(scope, AtomicOperation::CreateConcurrentExecution { transition });
        }
        Ok(())
    }

    fn join(&mut self, execution: ExecutionId, activity_id: &str) -> EngineResult<()> {
        let required = self.graph.incoming(activity_id).len().max(1);
        let scope = self.scope_ancestor(execution)?;

        if execution == scope || !self.tree.get(execution)?.is_concurrent {
            // Sequential arrival: nothing to synchronize with.
            self.leave(execution)?;
            return Ok(());
        }

        self.tree.get_mut(execution)?.is_active = false;

        let mut arrived = Vec::new();
        for sibling in self.tree.non_event_children(scope)? {
            let candidate = self.tree.get(sibling)?;
            if candidate.is_concurrent
                && !candidate.is_active
                && candidate.activity.as_deref() == Some(activity_id)
            {
                arrived.push(sibling);
            }
        }
        if arrived.len() < required {
            trace!(activity = activity_id, arrived = arrived.len(), required, "join waiting");
            return Ok(());
        }

        // All branches arrived: prune all but one, merge concurrency back
        // when it became unnecessary, and leave once.
        let keep = arrived[0];
        for other in &arrived[1..] {
            self.tree.remove_cascade(*other, "parallel join")?;
        }
        self.tree.compact(scope)?;
        let carrier = if self.tree.contains(keep) { keep } else { scope };
        {
            let continuation = self.tree.get_mut(carrier)?;
            continuation.is_active = true;
            continuation.activity = Some(activity_id.to_string());
        }
        self.leave(carrier)
    }

    // ------------------------------------------------------------------
    // cancel-scope / interrupt-scope
    // ------------------------------------------------------------------

    fn cancel_scope_operation(
        &mut self,
        execution: ExecutionId,
        cancelling_activity: &str,
        reason: &str,
    ) -> EngineResult<()> {
        // Assumption: `execution` is the scope execution owning the scope
        // to cancel.
        let propagating = if self.tree.get(execution)?.is_concurrent
            || execution == self.tree.root()
        {
            // Cancel in place: the execution itself continues.
            self.remove_children_and_notify(execution, reason)?;
            execution
        } else {
            let parent = self.tree.parent(execution)?.ok_or_else(|| {
                EngineError::Internal(format!("{execution}: scope execution without parent"))
            })?;
            self.remove_and_notify(execution, reason)?;
            parent
        };

        let continuation = self.tree.get_mut(propagating)?;
        continuation.activity = Some(cancelling_activity.to_string());
        continuation.transition = None;
        continuation.is_active = true;
        self.push(propagating, AtomicOperation::ExecuteActivity { from_job: false });
        Ok(())
    }

    fn interrupt_scope_operation(
        &mut self,
        execution: ExecutionId,
        interrupting_activity: &str,
        resume: Resume,
        reason: &str,
    ) -> EngineResult<()> {
        // Either the execution is the scope execution itself, or a
        // (concurrent) non-scope execution, as with terminate end events;
        // then the owning scope execution is interrupted.
        let target = self.scope_ancestor(execution)?;
        self.remove_children_and_notify(target, reason)?;

        let continuation = self.tree.get_mut(target)?;
        continuation.activity = Some(interrupting_activity.to_string());
        continuation.transition = None;
        continuation.is_active = true;
        match resume {
            Resume::Execute => {
                self.push(target, AtomicOperation::ExecuteActivity { from_job: false })
            }
            Resume::End => self.push(target, AtomicOperation::EndExecution),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // end-execution
    // ------------------------------------------------------------------

    fn end_execution(&mut self, execution: ExecutionId) -> EngineResult<()> {
        if let Some(activity) = self.tree.get(execution)?.activity.clone() {
            self.notify(ExecutionEvent::End {
                process_instance_id: self.tree.process_instance_id.clone(),
                execution,
                activity,
            });
        }

        if execution == self.tree.root() {
            return self.finish_instance();
        }

        if self.tree.get(execution)?.is_scope {
            // A compacted scope carrier reached an end from within: the
            // scope activity itself completes.
            return self.scope_completed(execution);
        }

        let parent = self.tree.parent(execution)?.ok_or_else(|| {
            EngineError::Internal(format!("{execution}: ended execution without parent"))
        })?;
        self.tree.remove_cascade(execution, "execution ended")?;
        self.branch_ended(parent)
    }

    fn branch_ended(&mut self, parent: ExecutionId) -> EngineResult<()> {
        let remaining = self.tree.non_event_children(parent)?;
        if remaining.is_empty() {
            if parent == self.tree.root() {
                // An in-flight root (activity still set) is only waiting,
                // not done.
                if self.tree.get(parent)?.activity.is_none() {
                    return self.finish_instance();
                }
                return Ok(());
            }
            if self.tree.get(parent)?.is_scope {
                return self.scope_completed(parent);
            }
            // An emptied concurrency anchor disappears and the question
            // moves one level up.
            let grandparent = self.tree.parent(parent)?.ok_or_else(|| {
                EngineError::Internal(format!("{parent}: anchor without parent"))
            })?;
            self.tree.remove_cascade(parent, "empty concurrency anchor")?;
            return self.branch_ended(grandparent);
        }
        if remaining.len() == 1 {
            // Concurrency became unnecessary: merge the surviving branch
            // back into the scope execution.
            self.tree.compact(parent)?;
        }
        Ok(())
    }

    fn scope_completed(&mut self, scope: ExecutionId) -> EngineResult<()> {
        if scope == self.tree.root() {
            return self.finish_instance();
        }
        let scope_activity = self.tree.get(scope)?.scope_activity.clone().ok_or_else(|| {
            EngineError::Internal(format!("{scope}: completing execution realizes no scope"))
        })?;
        {
            let execution = self.tree.get_mut(scope)?;
            execution.activity = Some(scope_activity.clone());
            execution.transition = None;
            execution.is_active = true;
        }
        self.notify(ExecutionEvent::End {
            process_instance_id: self.tree.process_instance_id.clone(),
            execution: scope,
            activity: scope_activity,
        });
        self.leave(scope)
    }

    fn finish_instance(&mut self) -> EngineResult<()> {
        let root = self.tree.root();
        self.remove_children_and_notify(root, "process instance ended")?;
        {
            let execution = self.tree.get_mut(root)?;
            execution.activity = None;
            execution.transition = None;
            execution.is_active = false;
        }
        self.tree.ended = true;
        self.artifacts.completed = true;
        debug!(process_instance = %self.tree.process_instance_id, "process instance ended");
        Ok(())
    }

    // ------------------------------------------------------------------
    // error propagation
    // ------------------------------------------------------------------

    /// Resolve a declared error by searching the chain of enclosing scopes
    /// for a matching handler, crossing into the calling instance when the
    /// chain is exhausted locally.
    pub(crate) fn raise_error(&mut self, execution: ExecutionId, code: &str) -> EngineResult<()> {
        let raising_activity = self.tree.get(execution)?.activity.clone();
        let mut scopes: Vec<Option<String>> = match &raising_activity {
            Some(activity) => self
                .graph
                .flow_scope_chain(activity)?
                .into_iter()
                .map(Some)
                .collect(),
            None => Vec::new(),
        };
        scopes.push(None); // the process level

        for scope in scopes {
            let handler = self
                .graph
                .scope_handlers(scope.as_deref())?
                .iter()
                .find(|h| h.matches(code))
                .cloned();
            if let Some(handler) = handler {
                debug!(code, scope = ?scope, handler = %handler.handler, "error caught by scope handler");
                let scope_execution = self.find_scope_execution(execution, scope.as_deref())?;
                // Control transfers to the handler as ordinary flow.
                self.push(
                    scope_execution,
                    AtomicOperation::InterruptScope {
                        activity: handler.handler,
                        resume: Resume::Execute,
                        reason: format!("error {code} caught"),
                    },
                );
                return Ok(());
            }
        }

        let root = self.tree.root();
        if let Some(link) = self.tree.get(root)?.super_execution.clone() {
            // The error consumes this instance and continues in the caller.
            debug!(code, "error propagates into calling process instance");
            self.remove_children_and_notify(root, "error propagation")?;
            {
                let execution = self.tree.get_mut(root)?;
                execution.activity = None;
                execution.is_active = false;
            }
            self.tree.ended = true;
            self.artifacts.escalation = Some(Escalation {
                link,
                code: code.to_string(),
            });
            return Ok(());
        }

        // A declared error code with no handler ends the execution quietly.
        debug!(code, execution = %execution, "no handler declared; ending execution");
        self.push(execution, AtomicOperation::EndExecution);
        Ok(())
    }

    /// The ancestor execution realizing `scope` (`None` = the process
    /// root), starting the upward walk at `from`.
    fn find_scope_execution(
        &self,
        from: ExecutionId,
        scope: Option<&str>,
    ) -> EngineResult<ExecutionId> {
        let mut current = Some(from);
        while let Some(cursor) = current {
            let execution = self.tree.get(cursor)?;
            match scope {
                None => {
                    if cursor == self.tree.root() {
                        return Ok(cursor);
                    }
                }
                Some(scope_id) => {
                    if execution.scope_activity.as_deref() == Some(scope_id) {
                        return Ok(cursor);
                    }
                }
            }
            current = execution.parent;
        }
        Err(EngineError::Internal(format!(
            "no execution realizes scope {scope:?}"
        )))
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    /// Nearest scope execution, including `execution` itself.
    pub(crate) fn scope_ancestor(&self, execution: ExecutionId) -> EngineResult<ExecutionId> {
        let mut current = execution;
        loop {
            let node = self.tree.get(current)?;
            if node.is_scope {
                return Ok(current);
            }
            current = node.parent.ok_or_else(|| {
                EngineError::Internal(format!("{execution}: no enclosing scope execution"))
            })?;
        }
    }

    /// The logical scope `execution` currently operates in (`None` = the
    /// process root).
    fn scope_context(&self, execution: ExecutionId) -> EngineResult<Option<String>> {
        let scope = self.scope_ancestor(execution)?;
        Ok(self.tree.get(scope)?.scope_activity.clone())
    }

    /// Cascade-remove `execution`, firing end notifications for every
    /// removed execution positioned at an activity.
    pub(crate) fn remove_and_notify(
        &mut self,
        execution: ExecutionId,
        reason: &str,
    ) -> EngineResult<()> {
        let removed = self.tree.remove_cascade(execution, reason)?;
        self.notify_removed(removed);
        Ok(())
    }

    /// Cascade-remove all children of `execution`, firing end
    /// notifications.
    pub(crate) fn remove_children_and_notify(
        &mut self,
        execution: ExecutionId,
        reason: &str,
    ) -> EngineResult<()> {
        let removed = self.tree.remove_children_cascade(execution, reason)?;
        self.notify_removed(removed);
        Ok(())
    }

    fn notify_removed(&mut self, removed: Vec<crate::tree::Execution>) {
        let process_instance_id = self.tree.process_instance_id.clone();
        for execution in removed {
            if let Some(activity) = execution.activity {
                self.notify(ExecutionEvent::End {
                    process_instance_id: process_instance_id.clone(),
                    execution: execution.id,
                    activity,
                });
            }
        }
    }

    /// Notify listeners, best-effort: a failing listener is logged and
    /// ignored so it can never corrupt tree invariants.
    pub(crate) fn notify(&mut self, event: ExecutionEvent) {
        for listener in self.listeners {
            if let Err(error) = listener.notify(&event) {
                warn!(%error, event = ?event, "execution listener failed");
            }
        }
    }
}
