//! Job persistence and the exclusive claim protocol.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};

use super::Job;

/// Storage contract for durable jobs.
///
/// `try_claim` is the concurrency-critical operation: it must apply its
/// revision and lock checks and the lock write as one atomic step so that
/// two workers racing for the same job see exactly one winner.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> EngineResult<()>;

    async fn find(&self, id: &str) -> EngineResult<Option<Job>>;

    /// Jobs eligible for acquisition at `now`, ordered by descending
    /// priority, then ascending due date, capped at `max`.
    async fn due_jobs(&self, now: DateTime<Utc>, max: usize) -> EngineResult<Vec<Job>>;

    /// Attempt to lock a job for `owner` until `until`.
    ///
    /// Succeeds only if the stored revision still equals `revision` and
    /// the job is unlocked or its lock has expired at `now`. A `false`
    /// return means another worker got there first; that is an expected
    /// outcome of contention, not an error.
    async fn try_claim(
        &self,
        id: &str,
        revision: u64,
        owner: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EngineResult<bool>;

    /// Write back a job under its optimistic revision. The stored revision
    /// must equal `job.revision`; on success the revision is bumped.
    async fn update(&self, job: Job) -> EngineResult<()>;

    /// Delete a job; `owner` must hold its lock if one is held.
    async fn delete(&self, id: &str, owner: &str) -> EngineResult<()>;

    /// Remove every job of a process instance, locked or not. Used by
    /// instance deletion and completion.
    async fn delete_for_instance(&self, process_instance_id: &str) -> EngineResult<()>;
}

/// In-memory [`JobStore`] backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> EngineResult<()> {
        self.jobs.lock().insert(job.id.clone(), job);
        Ok(())
    }

    async fn find(&self, id: &str) -> EngineResult<Option<Job>> {
        Ok(self.jobs.lock().get(id).cloned())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, max: usize) -> EngineResult<Vec<Job>> {
        let jobs = self.jobs.lock();
        let mut due: Vec<Job> = jobs
            .values()
            .filter(|job| job.is_acquirable(now) && !job.is_locked(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.due_date.cmp(&b.due_date))
                .then(a.id.cmp(&b.id))
        });
        due.truncate(max);
        Ok(due)
    }

    async fn try_claim(
        &self,
        id: &str,
        revision: u64,
        owner: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let mut jobs = self.jobs.lock();
        let job = match jobs.get_mut(id) {
            Some(job) => job,
            None => return Ok(false),
        };
        if job.revision != revision || job.is_locked(now) {
            return Ok(false);
        }
        job.lock_owner = Some(owner.to_string());
        job.lock_expiration_time = Some(until);
        job.revision += 1;
        Ok(true)
    }

    async fn update(&self, job: Job) -> EngineResult<()> {
        let mut jobs = self.jobs.lock();
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| EngineError::JobNotFound(job.id.clone()))?;
        if stored.revision != job.revision {
            return Err(EngineError::OptimisticLock(job.id.clone()));
        }
        let mut job = job;
        job.revision += 1;
        *stored = job;
        Ok(())
    }

    async fn delete(&self, id: &str, owner: &str) -> EngineResult<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get(id)
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
        if let Some(lock_owner) = &job.lock_owner {
            if lock_owner != owner {
                return Err(EngineError::NotLockOwner {
                    id: id.to_string(),
                    owner: owner.to_string(),
                });
            }
        }
        jobs.remove(id);
        Ok(())
    }

    async fn delete_for_instance(&self, process_instance_id: &str) -> EngineResult<()> {
        self.jobs
            .lock()
            .retain(|_, job| job.process_instance_id != process_instance_id);
        Ok(())
    }
}
