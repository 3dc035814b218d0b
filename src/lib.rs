//! procflow: a process-orchestration engine.
//!
//! A deployed process is a static [`graph::ProcessGraph`] of activities and
//! transitions with declared scope nesting. A running process instance is a
//! dynamic [`tree::ExecutionTree`] of executions interpreted by the
//! [`engine::ProcessEngine`] through small atomic operations, each leaving
//! the tree in an invariant-satisfying state. Work that must survive a
//! transaction boundary (async continuations, timers) becomes a durable
//! [`job::Job`] acquired and run by the [`job::JobExecutor`] under an
//! exclusive, expiring lock.
//!
//! | Module | Responsibility |
//! | ------ | -------------- |
//! | [`graph`] | Process definitions: build, index and validate the static graph |
//! | [`tree`] | Execution trees and the activity-instance projection |
//! | [`engine`] | The atomic-operation interpreter, instance modification and the engine facade |
//! | [`job`] | Durable jobs, the claim protocol, acquisition backoff and workers |
//! | [`error`] | The crate-wide error type |

pub mod engine;
pub mod error;
pub mod graph;
pub mod job;
pub mod tree;

pub use engine::{EngineConfig, ExecutionEvent, ExecutionListener, JobOutcome, ProcessEngine};
pub use error::{EngineError, EngineResult};
pub use graph::{
    Activity, ActivityBuilder, Behavior, ErrorHandler, ProcessGraph, ProcessGraphBuilder,
    Transition,
};
pub use job::{Job, JobExecutor, JobExecutorConfig, JobStore, JobType, MemoryJobStore};
pub use tree::{ActivityInstance, ExecutionId, ExecutionTree};
