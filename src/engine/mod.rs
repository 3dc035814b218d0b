//! Engine facade: deployments, process instances and transactions.
//!
//! [`ProcessEngine`] owns the deployed [`ProcessGraph`]s and the live
//! execution trees, and turns every public command into one interpreter
//! transaction. Tree surgery is synchronous and runs under the instance
//! registry lock; the produced [`RunArtifacts`](operations::RunArtifacts)
//! are settled afterwards: jobs are persisted, spawned sub-instances are
//! started and completion or error escalation is delivered to the calling
//! instance.

mod mapping;
mod modification;
mod operations;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::graph::{validate_graph, ProcessGraph};
use crate::job::{Job, JobStore, JobType};
use crate::tree::{project, ActivityInstance, ExecutionId, ExecutionTree, SuperLink};

use operations::{AtomicOperation, OperationEngine, RunArtifacts};

/// Engine tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on atomic operations per transaction; exceeding it
    /// aborts the transaction instead of looping forever.
    pub max_operations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_operations: 10_000,
        }
    }
}

/// Lifecycle event delivered to [`ExecutionListener`]s.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// An execution started an activity.
    Start {
        process_instance_id: String,
        execution: ExecutionId,
        activity: String,
    },
    /// An execution ended an activity, by completion or cancellation.
    End {
        process_instance_id: String,
        execution: ExecutionId,
        activity: String,
    },
    /// An execution took a transition.
    Take {
        process_instance_id: String,
        execution: ExecutionId,
        transition: String,
    },
}

/// What an acquired job did when handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job's effect was applied.
    Handled,
    /// The instance or execution the job refers to has meanwhile gone
    /// away, or the execution moved off the job's activity. The worker
    /// disposes of the job record.
    Stale,
}

/// Observer of execution lifecycle events.
///
/// Listener failures are logged and swallowed; they never fail the
/// transaction that produced the event.
pub trait ExecutionListener: Send + Sync {
    fn notify(&self, event: &ExecutionEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

struct Instance {
    graph: Arc<ProcessGraph>,
    tree: ExecutionTree,
}

/// The process engine.
pub struct ProcessEngine {
    config: EngineConfig,
    graphs: Mutex<HashMap<String, Arc<ProcessGraph>>>,
    // Each instance sits behind its own lock; the registry lock is only
    // held to look entries up, so distinct instances run in parallel.
    instances: Mutex<HashMap<String, Arc<Mutex<Instance>>>>,
    listeners: RwLock<Vec<Arc<dyn ExecutionListener>>>,
    job_store: Arc<dyn JobStore>,
    job_signal: Mutex<Option<Arc<Notify>>>,
}

impl ProcessEngine {
    pub fn new(config: EngineConfig, job_store: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            graphs: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            job_store,
            job_signal: Mutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        self.job_store.clone()
    }

    pub(crate) fn set_job_notifier(&self, signal: Arc<Notify>) {
        *self.job_signal.lock() = Some(signal);
    }

    pub(crate) fn notify_job_added(&self) {
        if let Some(signal) = self.job_signal.lock().as_ref() {
            signal.notify_waiters();
        }
    }

    pub fn has_instance(&self, process_instance_id: &str) -> bool {
        self.instances.lock().contains_key(process_instance_id)
    }

    /// IDs of all live process instances.
    pub fn process_instances(&self) -> Vec<String> {
        self.instances.lock().keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // deployment
    // ------------------------------------------------------------------

    /// Validate and register a process graph under its key. Redeploying a
    /// key replaces the graph for new instances; running instances keep
    /// the graph they started with.
    pub fn deploy(&self, graph: ProcessGraph) -> EngineResult<()> {
        validate_graph(&graph)?;
        let key = graph.key.clone();
        self.graphs.lock().insert(key.clone(), Arc::new(graph));
        info!(process = %key, "process deployed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // instance lifecycle
    // ------------------------------------------------------------------

    /// Start a new instance of the deployed process `process_key` and run
    /// it to its first wait state. Returns the process instance id.
    pub async fn start_instance(
        &self,
        process_key: &str,
        variables: HashMap<String, Value>,
    ) -> EngineResult<String> {
        let (instance_id, artifacts) = self.spawn_instance(process_key, None, variables)?;
        self.settle(instance_id.clone(), artifacts).await?;
        Ok(instance_id)
    }

    /// Deliver a signal to a waiting execution.
    pub async fn signal(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
        data: HashMap<String, Value>,
    ) -> EngineResult<()> {
        let artifacts =
            self.transaction(process_instance_id, |engine| engine.signal(execution, data))?;
        self.settle(process_instance_id.to_string(), artifacts).await
    }

    /// Re-enter the activity an execution currently points at, invoking
    /// its behavior as if flow had just arrived there.
    pub async fn execute_activity(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
    ) -> EngineResult<()> {
        let artifacts = self.transaction(process_instance_id, |engine| {
            engine.run(execution, AtomicOperation::ExecuteActivity { from_job: false })
        })?;
        self.settle(process_instance_id.to_string(), artifacts).await
    }

    /// Raise a declared process error at an execution.
    pub async fn propagate_error(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
        code: &str,
    ) -> EngineResult<()> {
        let artifacts = self.transaction(process_instance_id, |engine| {
            engine.propagate_error(execution, code)
        })?;
        self.settle(process_instance_id.to_string(), artifacts).await
    }

    /// Cancel the scope owning `execution`.
    pub async fn cancel_scope(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
        reason: &str,
    ) -> EngineResult<()> {
        let artifacts = self.transaction(process_instance_id, |engine| {
            engine.cancel_scope(execution, reason)
        })?;
        self.settle(process_instance_id.to_string(), artifacts).await
    }

    /// Interrupt the scope owning `execution`: its content is cancelled,
    /// the scope execution survives empty.
    pub async fn interrupt_scope(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
        reason: &str,
    ) -> EngineResult<()> {
        let artifacts = self.transaction(process_instance_id, |engine| {
            engine.interrupt_scope(execution, reason)
        })?;
        self.settle(process_instance_id.to_string(), artifacts).await
    }

    /// Delete a process instance outright, cancelling all of its work and
    /// removing its jobs. The calling instance, if any, is not notified.
    pub async fn delete_instance(&self, process_instance_id: &str, reason: &str) -> EngineResult<()> {
        // Run the cancellation for its listener notifications, but do not
        // settle: deletion never completes a calling instance.
        self.transaction(process_instance_id, |engine| {
            let root = engine.tree.root();
            engine.cancel_scope(root, reason)
        })?;
        self.remove_instance(process_instance_id).await
    }

    // ------------------------------------------------------------------
    // modification
    // ------------------------------------------------------------------

    pub async fn start_before_activity(
        &self,
        process_instance_id: &str,
        activity_id: &str,
        variables: HashMap<String, Value>,
        variables_local: HashMap<String, Value>,
    ) -> EngineResult<()> {
        let artifacts = self.transaction(process_instance_id, |engine| {
            modification::start_before_activity(engine, activity_id, variables, variables_local)
        })?;
        self.settle(process_instance_id.to_string(), artifacts).await
    }

    pub async fn start_after_activity(
        &self,
        process_instance_id: &str,
        activity_id: &str,
        variables: HashMap<String, Value>,
        variables_local: HashMap<String, Value>,
    ) -> EngineResult<()> {
        let artifacts = self.transaction(process_instance_id, |engine| {
            modification::start_after_activity(engine, activity_id, variables, variables_local)
        })?;
        self.settle(process_instance_id.to_string(), artifacts).await
    }

    pub async fn start_transition(
        &self,
        process_instance_id: &str,
        transition_id: &str,
        variables: HashMap<String, Value>,
        variables_local: HashMap<String, Value>,
    ) -> EngineResult<()> {
        let artifacts = self.transaction(process_instance_id, |engine| {
            modification::start_transition(engine, transition_id, variables, variables_local)
        })?;
        self.settle(process_instance_id.to_string(), artifacts).await
    }

    pub async fn cancel_activity_instance(
        &self,
        process_instance_id: &str,
        activity_instance_id: &str,
    ) -> EngineResult<()> {
        let artifacts = self.transaction(process_instance_id, |engine| {
            modification::cancel_activity_instance(engine, activity_instance_id)
        })?;
        self.settle(process_instance_id.to_string(), artifacts).await
    }

    // ------------------------------------------------------------------
    // queries and variables
    // ------------------------------------------------------------------

    /// Current activity-instance projection of an instance.
    pub fn activity_instances(&self, process_instance_id: &str) -> EngineResult<ActivityInstance> {
        let instance = self.instance(process_instance_id)?;
        let guard = instance.lock();
        project(&guard.tree)
    }

    /// Executions of an instance, for targeting signals and scope commands.
    pub fn executions(&self, process_instance_id: &str) -> EngineResult<Vec<ExecutionId>> {
        let instance = self.instance(process_instance_id)?;
        let guard = instance.lock();
        Ok(guard.tree.ids().collect())
    }

    /// Executions currently positioned at `activity_id`.
    pub fn executions_at(
        &self,
        process_instance_id: &str,
        activity_id: &str,
    ) -> EngineResult<Vec<ExecutionId>> {
        let instance = self.instance(process_instance_id)?;
        let guard = instance.lock();
        let mut at = Vec::new();
        for id in guard.tree.ids() {
            if guard.tree.get(id)?.activity.as_deref() == Some(activity_id) {
                at.push(id);
            }
        }
        Ok(at)
    }

    /// Variable lookup from an execution, walking the parent chain.
    pub fn variable(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
        name: &str,
    ) -> EngineResult<Option<Value>> {
        let instance = self.instance(process_instance_id)?;
        let guard = instance.lock();
        guard.tree.variable(execution, name)
    }

    /// Bind a variable, rebinding the nearest ancestor that already holds
    /// it, else binding at the root.
    pub fn set_variable(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
        name: String,
        value: Value,
    ) -> EngineResult<()> {
        let instance = self.instance(process_instance_id)?;
        let mut guard = instance.lock();
        guard.tree.set_variable(execution, name, value)
    }

    /// Bind a variable directly at `execution`.
    pub fn set_variable_local(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
        name: String,
        value: Value,
    ) -> EngineResult<()> {
        let instance = self.instance(process_instance_id)?;
        let mut guard = instance.lock();
        guard.tree.set_variable_local(execution, name, value)
    }

    // ------------------------------------------------------------------
    // job suspension
    // ------------------------------------------------------------------

    pub async fn suspend_job(&self, job_id: &str) -> EngineResult<()> {
        self.set_job_suspended(job_id, true).await
    }

    pub async fn activate_job(&self, job_id: &str) -> EngineResult<()> {
        self.set_job_suspended(job_id, false).await?;
        self.notify_job_added();
        Ok(())
    }

    async fn set_job_suspended(&self, job_id: &str, suspended: bool) -> EngineResult<()> {
        let mut job = self
            .job_store
            .find(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        job.suspended = suspended;
        self.job_store.update(job).await
    }

    // ------------------------------------------------------------------
    // job execution
    // ------------------------------------------------------------------

    /// Run the engine-side effect of an acquired job.
    pub async fn execute_job(&self, job: &Job) -> EngineResult<JobOutcome> {
        if self.job_is_stale(job) {
            debug!(job = %job.id, "job target no longer exists; skipping");
            return Ok(JobOutcome::Stale);
        }
        let artifacts = match &job.job_type {
            JobType::AsyncContinuation => self.transaction(&job.process_instance_id, |engine| {
                engine.run(
                    job.execution_id,
                    AtomicOperation::ExecuteActivity { from_job: true },
                )
            })?,
            JobType::Timer { .. } => self.transaction(&job.process_instance_id, |engine| {
                engine.signal(job.execution_id, HashMap::new())
            })?,
        };
        self.settle(job.process_instance_id.clone(), artifacts).await?;
        Ok(JobOutcome::Handled)
    }

    /// A job is stale when its instance or execution is gone, or when the
    /// execution has moved off the activity named by the job definition.
    fn job_is_stale(&self, job: &Job) -> bool {
        let instance = match self.instance(&job.process_instance_id) {
            Ok(instance) => instance,
            Err(_) => return true,
        };
        let guard = instance.lock();
        let execution = match guard.tree.get(job.execution_id) {
            Ok(execution) => execution,
            Err(_) => return true,
        };
        let expected_activity = job
            .job_definition_id
            .rsplit_once(':')
            .map(|(_, activity)| activity);
        execution.activity.as_deref() != expected_activity
    }

    /// Retry budget jobs of an instance started with, from its graph.
    pub(crate) fn initial_job_retries(&self, process_instance_id: &str) -> Option<u32> {
        let instance = self.instance(process_instance_id).ok()?;
        let retries = instance.lock().graph.default_job_retries;
        Some(retries)
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// Look an instance up; the registry lock is released before the
    /// returned handle is locked.
    fn instance(&self, process_instance_id: &str) -> EngineResult<Arc<Mutex<Instance>>> {
        self.instances
            .lock()
            .get(process_instance_id)
            .cloned()
            .ok_or_else(|| EngineError::InstanceNotFound(process_instance_id.to_string()))
    }

    /// Run one interpreter transaction against a live instance. Only the
    /// targeted instance is locked for the duration of the run.
    fn transaction<F>(&self, process_instance_id: &str, command: F) -> EngineResult<RunArtifacts>
    where
        F: FnOnce(OperationEngine<'_>) -> EngineResult<RunArtifacts>,
    {
        let listeners = self.listeners.read().clone();
        let instance = self.instance(process_instance_id)?;
        let mut guard = instance.lock();
        let Instance { graph, tree } = &mut *guard;
        command(OperationEngine::new(graph, tree, &listeners, &self.config))
    }

    /// Create a tree for a fresh instance and run it to its first wait
    /// state. The instance is registered even when it completed
    /// immediately; settlement removes it.
    fn spawn_instance(
        &self,
        process_key: &str,
        super_link: Option<SuperLink>,
        variables: HashMap<String, Value>,
    ) -> EngineResult<(String, RunArtifacts)> {
        let graph = self
            .graphs
            .lock()
            .get(process_key)
            .cloned()
            .ok_or_else(|| EngineError::ProcessNotFound(process_key.to_string()))?;
        let instance_id = Uuid::new_v4().to_string();
        let mut tree = ExecutionTree::new(&instance_id);
        let root = tree.root();
        tree.get_mut(root)?.super_execution = super_link;
        for (name, value) in variables {
            tree.set_variable(root, name, value)?;
        }
        let listeners = self.listeners.read().clone();
        let artifacts = OperationEngine::new(&graph, &mut tree, &listeners, &self.config).start()?;
        debug!(process = %process_key, instance = %instance_id, "process instance started");
        self.instances.lock().insert(
            instance_id.clone(),
            Arc::new(Mutex::new(Instance { graph, tree })),
        );
        Ok((instance_id, artifacts))
    }

    /// Settle the artifacts of a transaction, chasing cross-instance
    /// effects (sub-process spawns, completion of called instances, error
    /// escalation) until everything is quiescent.
    async fn settle(&self, instance: String, artifacts: RunArtifacts) -> EngineResult<()> {
        let mut queue: VecDeque<(String, RunArtifacts)> = VecDeque::new();
        queue.push_back((instance, artifacts));

        while let Some((instance, artifacts)) = queue.pop_front() {
            if !artifacts.jobs.is_empty() {
                for job in artifacts.jobs {
                    self.job_store.insert(job).await?;
                }
                self.notify_job_added();
            }

            for spawn in artifacts.spawns {
                let link = SuperLink {
                    process_instance_id: instance.clone(),
                    execution_id: spawn.super_execution,
                };
                let (sub_instance, sub_artifacts) =
                    self.spawn_instance(&spawn.process_key, Some(link), HashMap::new())?;
                queue.push_back((sub_instance, sub_artifacts));
            }

            if let Some(escalation) = artifacts.escalation {
                self.remove_instance(&instance).await?;
                let caller_artifacts = self.transaction(&escalation.link.process_instance_id, |engine| {
                    engine.propagate_error(escalation.link.execution_id, &escalation.code)
                })?;
                queue.push_back((escalation.link.process_instance_id, caller_artifacts));
                continue;
            }

            if artifacts.completed {
                let caller = self.instance(&instance).ok().and_then(|handle| {
                    let guard = handle.lock();
                    guard
                        .tree
                        .get(guard.tree.root())
                        .ok()
                        .and_then(|root| root.super_execution.clone())
                });
                self.remove_instance(&instance).await?;
                if let Some(link) = caller {
                    let caller_artifacts = self.transaction(&link.process_instance_id, |engine| {
                        engine.signal(link.execution_id, HashMap::new())
                    })?;
                    queue.push_back((link.process_instance_id, caller_artifacts));
                }
            }
        }
        Ok(())
    }

    async fn remove_instance(&self, process_instance_id: &str) -> EngineResult<()> {
        self.instances.lock().remove(process_instance_id);
        self.job_store.delete_for_instance(process_instance_id).await
    }
}
