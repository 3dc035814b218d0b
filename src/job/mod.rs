//! Durable job continuations.
//!
//! A [`Job`] is a durable record of engine work that must cross a
//! transaction boundary (async continuations, timers). Jobs are claimed
//! exclusively via a time-bound lock combined with an optimistic revision
//! check, executed, and deleted or re-scheduled; failures are retried with
//! backed-off due dates and an exhausted job stays visible with its
//! exception recorded.

mod executor;
mod store;
mod strategy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tree::ExecutionId;

pub use executor::{JobExecutor, JobExecutorConfig};
pub use store::{JobStore, MemoryJobStore};
pub use strategy::{AcquisitionConfiguration, AcquisitionReport, AcquisitionStrategy, BackoffStrategy};

/// Kind of continuation a job represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    /// Resume execution of an async activity.
    AsyncContinuation,
    /// Fire a timer; with `repeat_ms` set, the job is re-scheduled after
    /// every firing.
    Timer { repeat_ms: Option<i64> },
}

/// A durable, lockable unit of deferred engine work.
///
/// The field set is a shared-store contract: workers of different builds
/// acquire from the same queue, so it must stay stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub due_date: DateTime<Utc>,
    pub retries: u32,
    pub priority: i64,
    pub exception_message: Option<String>,
    pub process_instance_id: String,
    pub execution_id: ExecutionId,
    pub job_definition_id: String,
    pub revision: u64,
    pub suspended: bool,
}

impl Job {
    fn new(
        job_type: JobType,
        process_instance_id: &str,
        execution_id: ExecutionId,
        job_definition_id: String,
        due_date: DateTime<Utc>,
        priority: i64,
        retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type,
            lock_owner: None,
            lock_expiration_time: None,
            due_date,
            retries,
            priority,
            exception_message: None,
            process_instance_id: process_instance_id.to_string(),
            execution_id,
            job_definition_id,
            revision: 1,
            suspended: false,
        }
    }

    /// Continuation job for an async activity, due immediately.
    pub fn continuation(
        process_instance_id: &str,
        execution_id: ExecutionId,
        job_definition_id: String,
        priority: i64,
        retries: u32,
    ) -> Self {
        Self::new(
            JobType::AsyncContinuation,
            process_instance_id,
            execution_id,
            job_definition_id,
            Utc::now(),
            priority,
            retries,
        )
    }

    /// Timer job due at `due_date`.
    #[allow(clippy::too_many_arguments)]
    pub fn timer(
        process_instance_id: &str,
        execution_id: ExecutionId,
        job_definition_id: String,
        due_date: DateTime<Utc>,
        repeat_ms: Option<i64>,
        priority: i64,
        retries: u32,
    ) -> Self {
        Self::new(
            JobType::Timer { repeat_ms },
            process_instance_id,
            execution_id,
            job_definition_id,
            due_date,
            priority,
            retries,
        )
    }

    /// Whether the job's lock is held at `now`.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lock_expiration_time, Some(expiration) if expiration > now)
    }

    /// Whether an acquisition cycle may consider this job at `now`: due,
    /// not suspended and not retry-exhausted. Lock state is checked by the
    /// claim itself.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        !self.suspended && self.retries > 0 && self.due_date <= now
    }
}
