//! Instance modification scenarios: instantiating activities and
//! transitions in running instances, and cancelling activity instances.

use std::collections::HashMap;
use std::sync::Arc;

use procflow::{
    ActivityBuilder, Behavior, EngineConfig, EngineError, MemoryJobStore, ProcessEngine,
    ProcessGraph, ProcessGraphBuilder,
};

fn engine() -> ProcessEngine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    ProcessEngine::new(EngineConfig::default(), Arc::new(MemoryJobStore::new()))
}

/// start -> w -> done, plus `extra` and a sub-process reachable only by
/// modification.
fn modifiable_graph() -> ProcessGraph {
    ProcessGraphBuilder::new("mod")
        .activity(ActivityBuilder::new("start", Behavior::Automatic))
        .activity(ActivityBuilder::new("w", Behavior::Wait))
        .activity(ActivityBuilder::new("extra", Behavior::Wait))
        .activity(
            ActivityBuilder::new(
                "sub",
                Behavior::EmbeddedSubprocess {
                    initial: "inner".to_string(),
                },
            )
            .scope(),
        )
        .activity(ActivityBuilder::new("inner", Behavior::Wait).in_scope("sub"))
        .activity(ActivityBuilder::new("inner_done", Behavior::End).in_scope("sub"))
        .activity(ActivityBuilder::new("done", Behavior::End))
        .transition("t1", "start", "w")
        .transition("t2", "w", "done")
        .transition("t3", "extra", "done")
        .transition("t4", "inner", "inner_done")
        .transition("t5", "sub", "done")
        .initial("start")
        .build()
        .expect("graph builds")
}

#[tokio::test]
async fn test_start_before_grafts_concurrent_branch() {
    let engine = engine();
    engine.deploy(modifiable_graph()).unwrap();
    let instance = engine.start_instance("mod", HashMap::new()).await.unwrap();

    engine
        .start_before_activity(&instance, "extra", HashMap::new(), HashMap::new())
        .await
        .unwrap();

    let root = engine.activity_instances(&instance).unwrap();
    assert_eq!(root.children.len(), 2);
    assert!(root.find_by_activity("w").is_some());
    assert!(root.find_by_activity("extra").is_some());
}

#[tokio::test]
async fn test_cancel_restores_pre_modification_shape() {
    let engine = engine();
    engine.deploy(modifiable_graph()).unwrap();
    let instance = engine.start_instance("mod", HashMap::new()).await.unwrap();
    let before = engine.activity_instances(&instance).unwrap();

    engine
        .start_before_activity(&instance, "extra", HashMap::new(), HashMap::new())
        .await
        .unwrap();
    let extra_id = engine
        .activity_instances(&instance)
        .unwrap()
        .find_by_activity("extra")
        .expect("extra instantiated")
        .id
        .clone();
    engine
        .cancel_activity_instance(&instance, &extra_id)
        .await
        .unwrap();

    // the surviving branch merged back; the tree has its original shape
    let after = engine.activity_instances(&instance).unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_start_before_instantiates_missing_scope_chain() {
    let engine = engine();
    engine.deploy(modifiable_graph()).unwrap();
    let instance = engine.start_instance("mod", HashMap::new()).await.unwrap();

    engine
        .start_before_activity(&instance, "inner", HashMap::new(), HashMap::new())
        .await
        .unwrap();

    let root = engine.activity_instances(&instance).unwrap();
    let sub = root.find_by_activity("sub").expect("scope instantiated");
    assert!(sub.find_by_activity("inner").is_some());
    // the original wait state is untouched
    assert!(root.find_by_activity("w").is_some());
}

#[tokio::test]
async fn test_cancelling_the_last_activity_resets_the_instance() {
    let engine = engine();
    engine.deploy(modifiable_graph()).unwrap();
    let instance = engine.start_instance("mod", HashMap::new()).await.unwrap();

    let w_id = engine
        .activity_instances(&instance)
        .unwrap()
        .find_by_activity("w")
        .expect("waiting at w")
        .id
        .clone();
    engine.cancel_activity_instance(&instance, &w_id).await.unwrap();

    // the root is reset in place, not deleted
    assert!(engine.has_instance(&instance));
    let root = engine.activity_instances(&instance).unwrap();
    assert!(root.children.is_empty());

    // the instance can be revived by modification
    engine
        .start_before_activity(&instance, "w", HashMap::new(), HashMap::new())
        .await
        .unwrap();
    assert_eq!(engine.executions_at(&instance, "w").unwrap().len(), 1);
}

#[tokio::test]
async fn test_ambiguous_scope_target_is_rejected_before_mutation() {
    let engine = engine();
    engine.deploy(modifiable_graph()).unwrap();
    let instance = engine.start_instance("mod", HashMap::new()).await.unwrap();

    // two instantiations of the scope itself leave two `sub` executions
    engine
        .start_before_activity(&instance, "sub", HashMap::new(), HashMap::new())
        .await
        .unwrap();
    engine
        .start_before_activity(&instance, "sub", HashMap::new(), HashMap::new())
        .await
        .unwrap();

    let before = engine.activity_instances(&instance).unwrap();
    let result = engine
        .start_before_activity(&instance, "inner", HashMap::new(), HashMap::new())
        .await;
    assert!(matches!(result, Err(EngineError::AmbiguousExecution(_))));
    // the failed command did not touch the tree
    assert_eq!(engine.activity_instances(&instance).unwrap(), before);
}

#[tokio::test]
async fn test_cancel_unknown_activity_instance_errors() {
    let engine = engine();
    engine.deploy(modifiable_graph()).unwrap();
    let instance = engine.start_instance("mod", HashMap::new()).await.unwrap();

    let result = engine.cancel_activity_instance(&instance, "nope:e99").await;
    assert!(matches!(
        result,
        Err(EngineError::ActivityInstanceNotFound(_))
    ));
}

#[tokio::test]
async fn test_start_after_runs_the_outgoing_transition() {
    let engine = engine();
    engine.deploy(modifiable_graph()).unwrap();
    let instance = engine.start_instance("mod", HashMap::new()).await.unwrap();

    // start after w: the branch takes t2 into `done` and completes there,
    // while the original execution keeps waiting at w
    engine
        .start_after_activity(&instance, "w", HashMap::new(), HashMap::new())
        .await
        .unwrap();

    assert!(engine.has_instance(&instance));
    let root = engine.activity_instances(&instance).unwrap();
    assert_eq!(root.children.len(), 1);
    assert_eq!(root.children[0].activity_id.as_deref(), Some("w"));
}

#[tokio::test]
async fn test_start_transition_on_unknown_transition_errors() {
    let engine = engine();
    engine.deploy(modifiable_graph()).unwrap();
    let instance = engine.start_instance("mod", HashMap::new()).await.unwrap();

    let result = engine
        .start_transition(&instance, "no-such-transition", HashMap::new(), HashMap::new())
        .await;
    assert!(matches!(result, Err(EngineError::TransitionNotFound(_))));
}

#[tokio::test]
async fn test_variables_bind_before_the_branch_runs() {
    let engine = engine();
    engine.deploy(modifiable_graph()).unwrap();
    let instance = engine.start_instance("mod", HashMap::new()).await.unwrap();

    let mut variables = HashMap::new();
    variables.insert("order".to_string(), serde_json::json!(42));
    let mut locals = HashMap::new();
    locals.insert("scratch".to_string(), serde_json::json!("tmp"));
    engine
        .start_before_activity(&instance, "extra", variables, locals)
        .await
        .unwrap();

    let at_extra = engine.executions_at(&instance, "extra").unwrap();
    assert_eq!(
        engine.variable(&instance, at_extra[0], "order").unwrap(),
        Some(serde_json::json!(42))
    );
    assert_eq!(
        engine.variable(&instance, at_extra[0], "scratch").unwrap(),
        Some(serde_json::json!("tmp"))
    );
    // the local binding is invisible from the other branch
    let at_w = engine.executions_at(&instance, "w").unwrap();
    assert_eq!(engine.variable(&instance, at_w[0], "scratch").unwrap(), None);
}

#[tokio::test]
async fn test_interrupting_event_subprocess_cancels_scope_content() {
    let graph = ProcessGraphBuilder::new("alarmed")
        .activity(ActivityBuilder::new("start", Behavior::Automatic))
        .activity(
            ActivityBuilder::new(
                "sub",
                Behavior::EmbeddedSubprocess {
                    initial: "work".to_string(),
                },
            )
            .scope(),
        )
        .activity(ActivityBuilder::new("work", Behavior::Wait).in_scope("sub"))
        .activity(
            ActivityBuilder::new("alarm", Behavior::EventSubprocessStart)
                .interrupt_scope()
                .in_scope("sub"),
        )
        .activity(ActivityBuilder::new("react", Behavior::Wait).in_scope("sub"))
        .activity(ActivityBuilder::new("handled", Behavior::End).in_scope("sub"))
        .activity(ActivityBuilder::new("done", Behavior::End))
        .transition("t1", "start", "sub")
        .transition("t2", "alarm", "react")
        .transition("t3", "work", "handled")
        .transition("t4", "react", "handled")
        .transition("t5", "sub", "done")
        .initial("start")
        .build()
        .expect("graph builds");

    let engine = engine();
    engine.deploy(graph).unwrap();
    let instance = engine.start_instance("alarmed", HashMap::new()).await.unwrap();
    assert_eq!(engine.executions_at(&instance, "work").unwrap().len(), 1);

    engine
        .start_before_activity(&instance, "alarm", HashMap::new(), HashMap::new())
        .await
        .unwrap();

    // the scope content was cancelled; one execution continues at the
    // event sub-process flow
    assert!(engine.executions_at(&instance, "work").unwrap().is_empty());
    let at_react = engine.executions_at(&instance, "react").unwrap();
    assert_eq!(at_react.len(), 1);
}
