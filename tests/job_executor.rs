//! Worker scenarios: acquisition races, async continuations, timers,
//! retries and suspension.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use procflow::job::JobStore;
use procflow::{
    ActivityBuilder, Behavior, EngineConfig, Job, JobExecutor, JobExecutorConfig, MemoryJobStore,
    ProcessEngine, ProcessGraph, ProcessGraphBuilder,
};

fn engine() -> Arc<ProcessEngine> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Arc::new(ProcessEngine::new(
        EngineConfig::default(),
        Arc::new(MemoryJobStore::new()),
    ))
}

fn executor_config() -> JobExecutorConfig {
    JobExecutorConfig {
        worker_count: 2,
        lock_duration_ms: 60_000,
        retry_wait_ms: 10,
        lock_owner: "test-worker".to_string(),
    }
}

/// Poll until `condition` holds or a generous deadline passes.
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// start -> work (async) -> finish
fn async_graph() -> ProcessGraph {
    ProcessGraphBuilder::new("batch")
        .activity(ActivityBuilder::new("start", Behavior::Automatic))
        .activity(ActivityBuilder::new("work", Behavior::Automatic).asynchronous())
        .activity(ActivityBuilder::new("finish", Behavior::Wait))
        .activity(ActivityBuilder::new("done", Behavior::End))
        .transition("t1", "start", "work")
        .transition("t2", "work", "finish")
        .transition("t3", "finish", "done")
        .initial("start")
        .build()
        .expect("graph builds")
}

#[tokio::test]
async fn test_async_activity_is_resumed_by_a_worker() {
    let engine = engine();
    engine.deploy(async_graph()).unwrap();
    let instance = engine.start_instance("batch", HashMap::new()).await.unwrap();

    // the transaction stopped at the async boundary
    assert_eq!(engine.executions_at(&instance, "work").unwrap().len(), 1);
    assert_eq!(
        engine.job_store().due_jobs(Utc::now(), 10).await.unwrap().len(),
        1
    );

    let mut executor = JobExecutor::new(executor_config());
    executor.register_engine(engine.clone());
    executor.start();

    let engine_ref = engine.clone();
    let id = instance.clone();
    assert!(
        eventually(move || {
            engine_ref
                .executions_at(&id, "finish")
                .map(|at| at.len() == 1)
                .unwrap_or(false)
        })
        .await,
        "worker resumed the async activity"
    );
    executor.shutdown().await;

    assert!(engine.job_store().due_jobs(Utc::now(), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_claims_have_exactly_one_winner() {
    let store = Arc::new(MemoryJobStore::new());
    let tree = procflow::ExecutionTree::new("pi-race");
    let job = Job::continuation("pi-race", tree.root(), "p:a".into(), 0, 3);
    let id = job.id.clone();
    let revision = job.revision;
    store.insert(job).await.unwrap();

    let mut claims = Vec::new();
    for worker in 0..10 {
        let store = store.clone();
        let id = id.clone();
        claims.push(tokio::spawn(async move {
            let now = Utc::now();
            store
                .try_claim(
                    &id,
                    revision,
                    &format!("w{worker}"),
                    now + chrono::Duration::seconds(60),
                    now,
                )
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for claim in claims {
        if claim.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_higher_priority_jobs_are_acquired_first() {
    let store = MemoryJobStore::new();
    let tree = procflow::ExecutionTree::new("pi-prio");
    let urgent = Job::continuation("pi-prio", tree.root(), "p:urgent".into(), 90, 3);
    let routine = Job::continuation("pi-prio", tree.root(), "p:routine".into(), 20, 3);
    let urgent_id = urgent.id.clone();
    store.insert(routine).await.unwrap();
    store.insert(urgent).await.unwrap();

    let batch = store.due_jobs(Utc::now(), 1).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, urgent_id);
}

#[tokio::test]
async fn test_failing_job_exhausts_retries_and_stays_queryable() {
    // an async call activity to a never-deployed process fails on every
    // attempt, burning a retry each time
    let graph = ProcessGraphBuilder::new("flaky")
        .activity(ActivityBuilder::new("start", Behavior::Automatic))
        .activity(
            ActivityBuilder::new(
                "call",
                Behavior::CallActivity {
                    process_key: "never-deployed".to_string(),
                },
            )
            .asynchronous(),
        )
        .activity(ActivityBuilder::new("done", Behavior::End))
        .transition("t1", "start", "call")
        .transition("t2", "call", "done")
        .default_job_retries(2)
        .initial("start")
        .build()
        .expect("graph builds");

    let engine = engine();
    engine.deploy(graph).unwrap();
    let instance = engine.start_instance("flaky", HashMap::new()).await.unwrap();
    let store = engine.job_store();
    let job_id = store.due_jobs(Utc::now(), 1).await.unwrap().pop().expect("job queued").id;

    let mut executor = JobExecutor::new(executor_config());
    executor.register_engine(engine.clone());
    executor.start();

    let mut exhausted = false;
    for _ in 0..500 {
        if let Some(job) = store.find(&job_id).await.unwrap() {
            if job.retries == 0 && job.exception_message.is_some() {
                exhausted = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    executor.shutdown().await;
    assert!(exhausted, "retries were exhausted");

    // exhausted but not deleted, and never offered for acquisition again
    let job = store.find(&job_id).await.unwrap().expect("job kept");
    assert_eq!(job.retries, 0);
    assert!(job
        .exception_message
        .as_deref()
        .unwrap_or_default()
        .contains("never-deployed"));
    assert!(!store
        .due_jobs(Utc::now(), 10)
        .await
        .unwrap()
        .iter()
        .any(|due| due.id == job_id));
    // the instance itself is untouched and still waits at the boundary
    assert_eq!(engine.executions_at(&instance, "call").unwrap().len(), 1);
}

#[tokio::test]
async fn test_timer_fires_and_advances_the_instance() {
    let graph = ProcessGraphBuilder::new("timed")
        .activity(ActivityBuilder::new("start", Behavior::Automatic))
        .activity(
            ActivityBuilder::new(
                "delay",
                Behavior::Timer {
                    delay_ms: 20,
                    repeat: None,
                },
            ),
        )
        .activity(ActivityBuilder::new("after", Behavior::Wait))
        .activity(ActivityBuilder::new("done", Behavior::End))
        .transition("t1", "start", "delay")
        .transition("t2", "delay", "after")
        .transition("t3", "after", "done")
        .initial("start")
        .build()
        .expect("graph builds");

    let engine = engine();
    engine.deploy(graph).unwrap();
    let instance = engine.start_instance("timed", HashMap::new()).await.unwrap();
    assert_eq!(engine.executions_at(&instance, "delay").unwrap().len(), 1);

    let mut executor = JobExecutor::new(executor_config());
    executor.register_engine(engine.clone());
    executor.start();

    let engine_ref = engine.clone();
    let id = instance.clone();
    assert!(
        eventually(move || {
            engine_ref
                .executions_at(&id, "after")
                .map(|at| at.len() == 1)
                .unwrap_or(false)
        })
        .await,
        "timer fired"
    );
    executor.shutdown().await;
}

#[tokio::test]
async fn test_suspended_job_is_not_executed_until_activated() {
    let engine = engine();
    engine.deploy(async_graph()).unwrap();
    let instance = engine.start_instance("batch", HashMap::new()).await.unwrap();
    let job = engine
        .job_store()
        .due_jobs(Utc::now(), 1)
        .await
        .unwrap()
        .pop()
        .expect("continuation job");
    engine.suspend_job(&job.id).await.unwrap();

    let mut executor = JobExecutor::new(executor_config());
    executor.register_engine(engine.clone());
    executor.start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    // still parked at the async boundary
    assert_eq!(engine.executions_at(&instance, "work").unwrap().len(), 1);

    engine.activate_job(&job.id).await.unwrap();
    let engine_ref = engine.clone();
    let id = instance.clone();
    assert!(
        eventually(move || {
            engine_ref
                .executions_at(&id, "finish")
                .map(|at| at.len() == 1)
                .unwrap_or(false)
        })
        .await,
        "activated job was executed"
    );
    executor.shutdown().await;
}
