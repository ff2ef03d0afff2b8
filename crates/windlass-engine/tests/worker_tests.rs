//! Task worker tests: claims, registry misses, failure capture, and the
//! async sentinel.

mod common;

use chrono::Utc;
use serde_json::{Value, json};

use common::TestEngine;
use windlass_core::event::EventPayload;
use windlass_engine::dispatch::TaskEnvelope;
use windlass_engine::error::{Failure, codes};
use windlass_engine::queue::ExecutionQueue;
use windlass_engine::registry::Registry;
use windlass_engine::worker::TaskOutput;

fn envelope(name: &str, seq: u64, retry: u32) -> TaskEnvelope {
    TaskEnvelope {
        execution_id: "wf/run-1".parse().unwrap(),
        seq,
        name: name.into(),
        input: json!({"n": 1}),
        retry,
        scheduled_time: Utc::now(),
        heartbeat_timeout_secs: None,
    }
}

async fn drain_queue(engine: &TestEngine) -> Vec<EventPayload> {
    let mut payloads = Vec::new();
    for task in engine.queue.receive(16).await.unwrap() {
        for event in task.events {
            payloads.push(event.payload);
        }
        engine.queue.ack(&task.execution_id).await.unwrap();
    }
    payloads
}

#[tokio::test]
async fn successful_handler_emits_task_succeeded() {
    let mut registry = Registry::new();
    registry.register_task("double", |input, _ctx| {
        Box::pin(async move {
            let n = input["n"].as_i64().unwrap_or(0);
            Ok(TaskOutput::Complete(json!(n * 2)))
        })
    });
    let engine = TestEngine::new(registry);

    engine.worker.handle(envelope("double", 0, 0)).await.unwrap();

    let payloads = drain_queue(&engine).await;
    assert!(matches!(
        &payloads[..],
        [EventPayload::TaskSucceeded { seq: 0, result }] if result == &json!(2)
    ));
}

#[tokio::test]
async fn duplicate_delivery_is_claimed_once() {
    let mut registry = Registry::new();
    registry.register_task("once", |_input, _ctx| {
        Box::pin(async move { Ok(TaskOutput::Complete(Value::Null)) })
    });
    let engine = TestEngine::new(registry);

    engine.worker.handle(envelope("once", 0, 0)).await.unwrap();
    // Redelivered envelope: same (executionId, seq, retry).
    engine.worker.handle(envelope("once", 0, 0)).await.unwrap();

    let payloads = drain_queue(&engine).await;
    assert_eq!(payloads.len(), 1);
}

#[tokio::test]
async fn a_new_retry_is_a_fresh_claim() {
    let mut registry = Registry::new();
    registry.register_task("retryable", |_input, _ctx| {
        Box::pin(async move { Ok(TaskOutput::Complete(Value::Null)) })
    });
    let engine = TestEngine::new(registry);

    engine
        .worker
        .handle(envelope("retryable", 0, 0))
        .await
        .unwrap();
    engine
        .worker
        .handle(envelope("retryable", 0, 1))
        .await
        .unwrap();

    let payloads = drain_queue(&engine).await;
    assert_eq!(payloads.len(), 2);
}

#[tokio::test]
async fn unknown_task_name_fails_with_stable_code() {
    let engine = TestEngine::new(Registry::new());

    engine.worker.handle(envelope("ghost", 0, 0)).await.unwrap();

    let payloads = drain_queue(&engine).await;
    assert!(matches!(
        &payloads[..],
        [EventPayload::TaskFailed { seq: 0, error, .. }] if error == codes::TASK_NOT_FOUND
    ));
}

#[tokio::test]
async fn handler_failure_is_captured_as_data() {
    let mut registry = Registry::new();
    registry.register_task("explode", |_input, _ctx| {
        Box::pin(async move {
            Err::<TaskOutput, Failure>(Failure::new("PaymentDeclined", "card expired"))
        })
    });
    let engine = TestEngine::new(registry);

    engine.worker.handle(envelope("explode", 3, 0)).await.unwrap();

    let payloads = drain_queue(&engine).await;
    assert!(matches!(
        &payloads[..],
        [EventPayload::TaskFailed { seq: 3, error, message }]
            if error == "PaymentDeclined" && message == "card expired"
    ));
}

#[tokio::test]
async fn async_sentinel_suppresses_the_result_event() {
    let mut registry = Registry::new();
    registry.register_task("deferred", |_input, _ctx| {
        Box::pin(async move { Ok(TaskOutput::Async) })
    });
    let engine = TestEngine::new(registry);

    engine
        .worker
        .handle(envelope("deferred", 0, 0))
        .await
        .unwrap();

    assert!(drain_queue(&engine).await.is_empty());
}

#[tokio::test]
async fn poll_once_reports_an_empty_queue() {
    let engine = TestEngine::new(Registry::new());
    let handled = engine.worker.poll_once(&*engine.tasks).await.unwrap();
    assert!(!handled);
}
