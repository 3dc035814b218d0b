//! Background workers that acquire and run due jobs.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::{JobOutcome, ProcessEngine};
use crate::error::{EngineError, EngineResult};

use super::strategy::{AcquisitionReport, AcquisitionStrategy, BackoffStrategy};
use super::{Job, JobType};

/// Executor tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobExecutorConfig {
    /// Number of concurrent worker tasks.
    pub worker_count: usize,
    /// How long an acquired job stays locked for its worker.
    pub lock_duration_ms: i64,
    /// Base wait before a failed job becomes due again.
    pub retry_wait_ms: i64,
    /// Prefix for the per-worker lock owner ids.
    pub lock_owner: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            lock_duration_ms: 5 * 60 * 1000,
            retry_wait_ms: 5_000,
            lock_owner: "worker".to_string(),
        }
    }
}

/// Runs acquisition/execution cycles against the registered engines.
///
/// Each worker task owns a distinct lock owner id and its own
/// [`BackoffStrategy`], cycling round-robin over the engines. Workers never
/// abort on a failing job; the failure is written back to the job record
/// and the cycle moves on.
pub struct JobExecutor {
    config: JobExecutorConfig,
    engines: Vec<Arc<ProcessEngine>>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    workers: Vec<JoinHandle<()>>,
}

impl JobExecutor {
    pub fn new(config: JobExecutorConfig) -> Self {
        Self {
            config,
            engines: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            workers: Vec::new(),
        }
    }

    /// Add an engine to the acquisition rotation. The engine's job
    /// notification is wired to wake idle workers early.
    pub fn register_engine(&mut self, engine: Arc<ProcessEngine>) {
        engine.set_job_notifier(self.wake.clone());
        self.engines.push(engine);
    }

    /// Spawn the worker tasks.
    pub fn start(&mut self) {
        for worker_index in 0..self.config.worker_count {
            let worker = Worker {
                lock_owner: format!(
                    "{}-{}-{}",
                    self.config.lock_owner,
                    worker_index,
                    Uuid::new_v4()
                ),
                config: self.config.clone(),
                engines: self.engines.clone(),
                shutdown: self.shutdown.clone(),
                wake: self.wake.clone(),
            };
            self.workers.push(tokio::spawn(worker.run()));
        }
    }

    /// Stop the workers and wait for in-flight cycles to finish.
    pub async fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        for result in futures::future::join_all(self.workers.drain(..)).await {
            if let Err(error) = result {
                warn!(%error, "worker task panicked during shutdown");
            }
        }
    }
}

struct Worker {
    lock_owner: String,
    config: JobExecutorConfig,
    engines: Vec<Arc<ProcessEngine>>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Worker {
    async fn run(self) {
        if self.engines.is_empty() {
            warn!(worker = %self.lock_owner, "no engines registered; worker exiting");
            return;
        }
        let mut strategy = BackoffStrategy::new();
        let mut configuration = strategy.initial_configuration();
        let mut rotation = 0usize;

        while !self.shutdown.load(Ordering::SeqCst) {
            let engine = &self.engines[rotation % self.engines.len()];
            rotation = rotation.wrapping_add(1);

            let report = match self.cycle(engine, configuration.num_jobs_to_acquire).await {
                Ok(report) => report,
                Err(error) => {
                    warn!(worker = %self.lock_owner, %error, "acquisition cycle failed");
                    AcquisitionReport {
                        requested: configuration.num_jobs_to_acquire,
                        ..AcquisitionReport::default()
                    }
                }
            };
            configuration = strategy.reconfigure(&report, &configuration);

            if !configuration.wait_time.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(configuration.wait_time) => {}
                    _ = self.wake.notified() => {}
                }
            }
        }
    }

    async fn cycle(&self, engine: &Arc<ProcessEngine>, batch: usize) -> EngineResult<AcquisitionReport> {
        let store = engine.job_store();
        let now = Utc::now();
        let candidates = store.due_jobs(now, batch).await?;

        let mut report = AcquisitionReport {
            requested: batch,
            ..AcquisitionReport::default()
        };
        let lock_until = now + ChronoDuration::milliseconds(self.config.lock_duration_ms);
        let mut acquired = Vec::new();
        for candidate in candidates {
            if store
                .try_claim(&candidate.id, candidate.revision, &self.lock_owner, lock_until, now)
                .await?
            {
                report.acquired += 1;
                acquired.push(candidate.id);
            } else {
                report.failed_to_lock += 1;
            }
        }

        for id in acquired {
            // refetch for the post-claim revision and lock fields
            let job = match store.find(&id).await? {
                Some(job) => job,
                None => continue,
            };
            self.execute(engine, job).await;
        }
        Ok(report)
    }

    async fn execute(&self, engine: &Arc<ProcessEngine>, job: Job) {
        debug!(
            worker = %self.lock_owner,
            job = %job.id,
            definition = %job.job_definition_id,
            "executing job"
        );
        match engine.execute_job(&job).await {
            Ok(JobOutcome::Handled) => {
                if let Err(error) = self.complete(engine, job).await {
                    warn!(worker = %self.lock_owner, %error, "failed to complete job");
                }
            }
            Ok(JobOutcome::Stale) => {
                debug!(worker = %self.lock_owner, job = %job.id, "discarding stale job");
                if let Err(error) = engine.job_store().delete(&job.id, &self.lock_owner).await {
                    warn!(worker = %self.lock_owner, %error, "failed to delete stale job");
                }
            }
            Err(error) => {
                if let Err(write_error) = self.record_failure(engine, job, &error.to_string()).await {
                    warn!(worker = %self.lock_owner, error = %write_error, "failed to record job failure");
                }
            }
        }
    }

    async fn complete(&self, engine: &Arc<ProcessEngine>, mut job: Job) -> EngineResult<()> {
        let store = engine.job_store();
        if let JobType::Timer { repeat_ms: Some(repeat) } = job.job_type {
            if !engine.has_instance(&job.process_instance_id) {
                // the instance ended since the last firing
                return self.delete_finished(engine, &job.id).await;
            }
            job.lock_owner = None;
            job.lock_expiration_time = None;
            job.exception_message = None;
            job.due_date = Utc::now() + ChronoDuration::milliseconds(repeat);
            store.update(job).await?;
            engine.notify_job_added();
            Ok(())
        } else {
            self.delete_finished(engine, &job.id).await
        }
    }

    /// Delete a finished job. The job may already be gone when its own
    /// execution completed the instance; that is not an error.
    async fn delete_finished(&self, engine: &Arc<ProcessEngine>, job_id: &str) -> EngineResult<()> {
        match engine.job_store().delete(job_id, &self.lock_owner).await {
            Err(EngineError::JobNotFound(_)) => Ok(()),
            result => result,
        }
    }

    async fn record_failure(
        &self,
        engine: &Arc<ProcessEngine>,
        mut job: Job,
        message: &str,
    ) -> EngineResult<()> {
        let initial_retries = engine
            .initial_job_retries(&job.process_instance_id)
            .unwrap_or(job.retries);
        job.retries = job.retries.saturating_sub(1);
        job.exception_message = Some(message.to_string());
        job.lock_owner = None;
        job.lock_expiration_time = None;
        let wait = retry_backoff_ms(self.config.retry_wait_ms, initial_retries, job.retries);
        job.due_date = Utc::now() + ChronoDuration::milliseconds(wait);
        if job.retries == 0 {
            warn!(
                job = %job.id,
                definition = %job.job_definition_id,
                %message,
                "job retries exhausted"
            );
        }
        engine.job_store().update(job).await
    }
}

/// Wait before a failed job becomes due again: the base wait doubled for
/// every retry already used, so repeated failures back off.
fn retry_backoff_ms(base_ms: i64, initial_retries: u32, retries_left: u32) -> i64 {
    let used = initial_retries.saturating_sub(retries_left).max(1);
    let exponent = (used - 1).min(16);
    base_ms.saturating_mul(1_i64 << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_wait_doubles_per_used_attempt() {
        // retries 3 -> 2 -> 1 -> 0: each failure waits twice as long
        assert_eq!(retry_backoff_ms(5_000, 3, 2), 5_000);
        assert_eq!(retry_backoff_ms(5_000, 3, 1), 10_000);
        assert_eq!(retry_backoff_ms(5_000, 3, 0), 20_000);
    }

    #[test]
    fn test_retry_wait_is_bounded() {
        let capped = retry_backoff_ms(5_000, 100, 0);
        assert_eq!(capped, 5_000 * (1 << 16));
        // unknown budget degrades to the base wait
        assert_eq!(retry_backoff_ms(5_000, 0, 0), 5_000);
    }
}
