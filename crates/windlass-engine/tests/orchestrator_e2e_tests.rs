//! End-to-end engine tests over the in-memory infrastructure.
//!
//! Each test wires the full engine (service, orchestrator, command executor,
//! task worker, timer service, routers) and drives a workflow from
//! `StartExecution` to its terminal status.

mod common;

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use serde_json::{Value, json};

use common::TestEngine;
use windlass_core::event::{EmittedEvent, EventPayload};
use windlass_core::{ExecutionName, ExecutionStatus, SignalId, WorkflowName};
use windlass_engine::error::codes;
use windlass_engine::executor::TaskOptions;
use windlass_engine::queue::ExecutionQueue;
use windlass_engine::registry::{Registry, Subscription};
use windlass_engine::service::{EngineClient, StartExecutionRequest};
use windlass_engine::store::{EntityStore, HistoryStore, JournalStore, PageRequest};
use windlass_engine::worker::TaskOutput;

fn start_request(workflow: &str, name: &str, input: Value) -> StartExecutionRequest {
    StartExecutionRequest {
        workflow: WorkflowName::new(workflow).unwrap(),
        execution_name: Some(ExecutionName::new(name).unwrap()),
        input,
        timeout: None,
        parent: None,
    }
}

#[tokio::test]
async fn single_task_workflow_runs_to_success() {
    let mut registry = Registry::new();
    registry.register_task("hello", |input, _ctx| {
        Box::pin(async move {
            let name = input["name"].as_str().unwrap_or("world").to_string();
            Ok(TaskOutput::Complete(json!(format!("hi {name}"))))
        })
    });
    registry.register_workflow(WorkflowName::new("greeter").unwrap(), |input, ctx| {
        Box::pin(async move { ctx.task("hello", input).await })
    });
    let engine = TestEngine::new(registry);

    let response = engine
        .service
        .start_execution(start_request("greeter", "run-1", json!({"name": "world"})))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.result, Some(json!("hi world")));
    assert!(execution.end_time.is_some());

    // History carries the full event-sourced trail.
    let history = engine
        .service
        .get_execution_history(&response.execution_id, &PageRequest::first(0))
        .await
        .unwrap();
    let types: Vec<&str> = history
        .items
        .iter()
        .map(|event| event.payload.event_type())
        .collect();
    assert!(types.contains(&"WorkflowStarted"));
    assert!(types.contains(&"TaskScheduled"));
    assert!(types.contains(&"TaskSucceeded"));
    assert!(types.contains(&"WorkflowSucceeded"));

    // The journal saw every appended event.
    let journal = engine.journal.read(&response.execution_id).await.unwrap();
    assert!(!journal.is_empty());
}

#[tokio::test]
async fn timer_workflow_wakes_after_the_due_time() {
    let mut registry = Registry::new();
    registry.register_task("a", |_input, _ctx| {
        Box::pin(async move { Ok(TaskOutput::Complete(json!(42))) })
    });
    registry.register_workflow(WorkflowName::new("sleeper").unwrap(), |_input, ctx| {
        Box::pin(async move {
            ctx.sleep(Duration::seconds(5)).await?;
            ctx.task("a", Value::Null).await
        })
    });
    let engine = TestEngine::new(registry);

    let response = engine
        .service
        .start_execution(start_request("sleeper", "run-1", Value::Null))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    // Still asleep.
    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::InProgress);

    // Fast-forward past the timer.
    engine
        .drain_at(Utc::now() + Duration::seconds(6))
        .await
        .unwrap();
    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.result, Some(json!(42)));
}

#[tokio::test]
async fn child_workflow_result_reaches_the_parent() {
    let mut registry = Registry::new();
    registry.register_workflow(WorkflowName::new("sub").unwrap(), |input, _ctx| {
        Box::pin(async move {
            let n = input.as_i64().unwrap_or(0);
            Ok(json!(n * 6))
        })
    });
    registry.register_workflow(WorkflowName::new("parent").unwrap(), |_input, ctx| {
        Box::pin(async move {
            ctx.child_workflow(WorkflowName::new("sub").unwrap(), json!(7))
                .await
        })
    });
    let engine = TestEngine::new(registry);

    let response = engine
        .service
        .start_execution(start_request("parent", "run-1", Value::Null))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    let parent = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent.status, ExecutionStatus::Succeeded);
    assert_eq!(parent.result, Some(json!(42)));

    // The child is named deterministically from the parent and seq, and
    // carries the parent reference.
    let child_id = "sub/run-1/0".parse().unwrap();
    let child = engine
        .service
        .get_execution(&child_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child.status, ExecutionStatus::Succeeded);
    let parent_ref = child.parent.unwrap();
    assert_eq!(parent_ref.execution_id, response.execution_id);
    assert_eq!(parent_ref.seq, 0);
}

#[tokio::test]
async fn missing_workflow_fails_terminally() {
    let engine = TestEngine::new(Registry::new());
    let response = engine
        .service
        .start_execution(start_request("ghost", "run-1", Value::Null))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some(codes::WORKFLOW_NOT_FOUND));
}

#[tokio::test]
async fn signal_delivery_resolves_an_expecting_workflow() {
    let mut registry = Registry::new();
    registry.register_workflow(WorkflowName::new("gate").unwrap(), |_input, ctx| {
        Box::pin(async move {
            ctx.expect_signal(SignalId::new("go"), Some(Duration::minutes(5)))
                .await
        })
    });
    let engine = TestEngine::new(registry);

    let response = engine
        .service
        .start_execution(start_request("gate", "run-1", Value::Null))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    engine
        .service
        .send_signal(
            response.execution_id.clone(),
            SignalId::new("go"),
            json!("ok"),
            None,
        )
        .await
        .unwrap();
    engine.drain().await.unwrap();

    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.result, Some(json!("ok")));
}

#[tokio::test]
async fn workflow_timeout_marks_the_execution_timed_out() {
    let mut registry = Registry::new();
    registry.register_workflow(WorkflowName::new("stuck").unwrap(), |_input, ctx| {
        Box::pin(async move { ctx.expect_signal(SignalId::new("never"), None).await })
    });
    let engine = TestEngine::new(registry);

    let mut request = start_request("stuck", "run-1", Value::Null);
    request.timeout = Some(Duration::seconds(30));
    let response = engine.service.start_execution(request).await.unwrap();
    engine.drain().await.unwrap();

    engine
        .drain_at(Utc::now() + Duration::seconds(31))
        .await
        .unwrap();
    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::TimedOut);
    assert_eq!(execution.error.as_deref(), Some(codes::TIMEOUT));
    assert!(execution.end_time.is_some());
}

#[tokio::test]
async fn task_timeout_fails_the_waiting_workflow() {
    let mut registry = Registry::new();
    // The task defers its result and never reports back.
    registry.register_task("slow", |_input, _ctx| {
        Box::pin(async move { Ok(TaskOutput::Async) })
    });
    registry.register_workflow(WorkflowName::new("impatient").unwrap(), |_input, ctx| {
        Box::pin(async move {
            ctx.task_with_options(
                "slow",
                Value::Null,
                TaskOptions {
                    timeout: Some(Duration::seconds(30)),
                    heartbeat_timeout: None,
                },
            )
            .await
        })
    });
    let engine = TestEngine::new(registry);

    let response = engine
        .service
        .start_execution(start_request("impatient", "run-1", Value::Null))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    engine
        .drain_at(Utc::now() + Duration::seconds(31))
        .await
        .unwrap();
    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some(codes::TIMEOUT));
}

#[tokio::test]
async fn async_task_completes_via_the_token() {
    let token_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let capture = Arc::clone(&token_slot);

    let mut registry = Registry::new();
    registry.register_task("deferred", move |_input, ctx| {
        let capture = Arc::clone(&capture);
        Box::pin(async move {
            *capture.lock().unwrap() = Some(ctx.task_token().to_string());
            Ok(TaskOutput::Async)
        })
    });
    registry.register_workflow(WorkflowName::new("patient").unwrap(), |_input, ctx| {
        Box::pin(async move { ctx.task("deferred", Value::Null).await })
    });
    let engine = TestEngine::new(registry);

    let response = engine
        .service
        .start_execution(start_request("patient", "run-1", Value::Null))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    // No result event yet: the workflow is still waiting.
    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::InProgress);

    // The out-of-band completion lands through the token.
    let token = token_slot.lock().unwrap().clone().unwrap();
    engine
        .service
        .send_task_success(&token, json!("late result"))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.result, Some(json!("late result")));
}

#[tokio::test]
async fn heartbeat_lapse_fails_a_deferred_task() {
    let mut registry = Registry::new();
    registry.register_task("quiet", |_input, _ctx| {
        Box::pin(async move { Ok(TaskOutput::Async) })
    });
    registry.register_workflow(WorkflowName::new("monitored").unwrap(), |_input, ctx| {
        Box::pin(async move {
            ctx.task_with_options(
                "quiet",
                Value::Null,
                TaskOptions {
                    timeout: None,
                    heartbeat_timeout: Some(Duration::seconds(30)),
                },
            )
            .await
        })
    });
    let engine = TestEngine::new(registry);

    let response = engine
        .service
        .start_execution(start_request("monitored", "run-1", Value::Null))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    engine
        .drain_at(Utc::now() + Duration::seconds(31))
        .await
        .unwrap();
    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some(codes::HEARTBEAT_TIMED_OUT));
}

#[tokio::test]
async fn entity_ops_round_trip_through_the_store() {
    let mut registry = Registry::new();
    registry.register_workflow(WorkflowName::new("counter").unwrap(), |_input, ctx| {
        Box::pin(async move {
            ctx.entity_set("count", json!(5)).await?;
            ctx.entity_get("count").await
        })
    });
    let engine = TestEngine::new(registry);

    let response = engine
        .service
        .start_execution(start_request("counter", "run-1", Value::Null))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.result, Some(json!(5)));
    assert_eq!(
        engine.entities.get("count").await.unwrap().unwrap().value,
        json!(5)
    );
}

#[tokio::test]
async fn emitted_events_reach_matching_subscriptions() {
    let received: Arc<Mutex<Vec<EmittedEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    let mut registry = Registry::new();
    registry.register_subscription(Subscription {
        name: "audit".into(),
        event_name: Some("order-shipped".into()),
        predicate: None,
        handler: Arc::new(move |event| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(event);
                Ok(())
            })
        }),
    });
    registry.register_workflow(WorkflowName::new("shipper").unwrap(), |_input, ctx| {
        Box::pin(async move {
            ctx.emit_events(vec![EmittedEvent::new(
                "order-shipped",
                json!({"order": 9}),
            )])
            .await?;
            Ok(Value::Null)
        })
    });
    let engine = TestEngine::new(registry);

    engine
        .service
        .start_execution(start_request("shipper", "run-1", Value::Null))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, json!({"order": 9}));
}

#[tokio::test]
async fn workflow_transaction_commits_and_reports_back() {
    let mut registry = Registry::new();
    registry.register_transaction("increment", |_input, ctx| {
        Box::pin(async move {
            let current = ctx
                .get("counter")
                .await?
                .and_then(|value| value.as_i64())
                .unwrap_or(0);
            ctx.set("counter", json!(current + 1)).await?;
            Ok(json!(current + 1))
        })
    });
    registry.register_workflow(WorkflowName::new("teller").unwrap(), |_input, ctx| {
        Box::pin(async move { ctx.transaction("increment", Value::Null).await })
    });
    let engine = TestEngine::new(registry);

    let response = engine
        .service
        .start_execution(start_request("teller", "run-1", Value::Null))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.result, Some(json!(1)));
    assert_eq!(
        engine.entities.get("counter").await.unwrap().unwrap().value,
        json!(1)
    );
}

#[tokio::test]
async fn redelivered_task_events_do_not_double_apply() {
    let mut registry = Registry::new();
    registry.register_task("hello", |_input, _ctx| {
        Box::pin(async move { Ok(TaskOutput::Complete(json!("hi"))) })
    });
    registry.register_workflow(WorkflowName::new("greeter").unwrap(), |input, ctx| {
        Box::pin(async move { ctx.task("hello", input).await })
    });
    let engine = TestEngine::new(registry);

    let response = engine
        .service
        .start_execution(start_request("greeter", "run-1", Value::Null))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    // Replay the completed result event as a duplicate delivery.
    engine
        .queue
        .submit(windlass_engine::queue::WorkflowTask::single(
            response.execution_id.clone(),
            windlass_core::HistoryEvent::new(EventPayload::TaskSucceeded {
                seq: 0,
                result: json!("hi"),
            }),
        ))
        .await
        .unwrap();
    engine.drain().await.unwrap();

    let execution = engine
        .service
        .get_execution(&response.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.result, Some(json!("hi")));

    // Exactly one terminal event in history.
    let history = engine.history.read(&response.execution_id).await.unwrap();
    let terminals = history
        .iter()
        .filter(|event| matches!(event.payload, EventPayload::WorkflowSucceeded { .. }))
        .count();
    assert_eq!(terminals, 1);
}
