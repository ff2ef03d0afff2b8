//! Turns workflow commands into side effects plus scheduled history events.
//!
//! Each command maps to exactly one scheduled event, returned to the
//! orchestrator for history append. When a command needs both a side effect
//! and a timeout schedule (task dispatch + task timeout, signal wait +
//! expiry), the two are issued concurrently; the scheduled event is emitted
//! regardless.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;

use windlass_core::event::{BucketOperation, EntityOperation, EventPayload};
use windlass_core::execution::ParentRef;
use windlass_core::{ExecutionId, HistoryEvent};

use crate::command::WorkflowCommand;
use crate::dispatch::{TaskEnvelope, TaskQueue, TransactionEnvelope, TransactionQueue};
use crate::error::{Result, codes};
use crate::metrics::{labels, names};
use crate::queue::{ExecutionQueue, WorkflowTask};
use crate::router::EventRouter;
use crate::service::{EngineClient, StartExecutionRequest};
use crate::store::{BucketStore, EntityStore, SearchStore};
use crate::timer::TimerService;

/// Executes workflow commands against the engine's side-effect surfaces.
pub struct CommandExecutor {
    queue: Arc<dyn ExecutionQueue>,
    tasks: Arc<dyn TaskQueue>,
    transactions: Arc<dyn TransactionQueue>,
    timer: Arc<TimerService>,
    events: Arc<EventRouter>,
    client: Arc<dyn EngineClient>,
    entities: Arc<dyn EntityStore>,
    buckets: Arc<dyn BucketStore>,
    search: Arc<dyn SearchStore>,
}

impl CommandExecutor {
    /// Creates a command executor.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn ExecutionQueue>,
        tasks: Arc<dyn TaskQueue>,
        transactions: Arc<dyn TransactionQueue>,
        timer: Arc<TimerService>,
        events: Arc<EventRouter>,
        client: Arc<dyn EngineClient>,
        entities: Arc<dyn EntityStore>,
        buckets: Arc<dyn BucketStore>,
        search: Arc<dyn SearchStore>,
    ) -> Self {
        Self {
            queue,
            tasks,
            transactions,
            timer,
            events,
            client,
            entities,
            buckets,
            search,
        }
    }

    /// Performs `command`'s side effect and returns its scheduled event.
    ///
    /// # Errors
    ///
    /// Returns an error on queue, timer, or store faults; these are system
    /// errors and the orchestrator NACKs the workflow task for redelivery.
    #[tracing::instrument(
        skip(self, command),
        fields(execution_id = %execution_id, command = command.kind(), seq = command.seq())
    )]
    pub async fn execute(
        &self,
        execution_id: &ExecutionId,
        command: WorkflowCommand,
        base_time: DateTime<Utc>,
    ) -> Result<HistoryEvent> {
        counter!(names::COMMANDS_TOTAL, labels::COMMAND => command.kind()).increment(1);
        match command {
            WorkflowCommand::StartTask {
                seq,
                name,
                input,
                timeout,
                heartbeat_timeout,
            } => {
                let envelope = TaskEnvelope {
                    execution_id: execution_id.clone(),
                    seq,
                    name: name.clone(),
                    input,
                    retry: 0,
                    scheduled_time: base_time,
                    heartbeat_timeout_secs: heartbeat_timeout
                        .and_then(|window| u64::try_from(window.num_seconds()).ok()),
                };

                let dispatch = self.tasks.enqueue(envelope);
                let expiry = async {
                    match timeout {
                        Some(timeout) => self
                            .timer
                            .schedule_event(
                                execution_id.clone(),
                                HistoryEvent::new(EventPayload::TaskFailed {
                                    seq,
                                    error: codes::TIMEOUT.to_string(),
                                    message: format!(
                                        "task '{name}' did not complete within {}s",
                                        timeout.num_seconds()
                                    ),
                                }),
                                base_time + timeout,
                                base_time,
                            )
                            .await
                            .map(|_| ()),
                        None => Ok(()),
                    }
                };
                let (dispatched, expired) = tokio::join!(dispatch, expiry);
                dispatched?;
                expired?;

                Ok(HistoryEvent::new(EventPayload::TaskScheduled { seq, name }))
            }

            WorkflowCommand::StartTimer { seq, spec } => {
                let until_time = spec.due_time(base_time);
                self.timer
                    .schedule_event(
                        execution_id.clone(),
                        HistoryEvent::new(EventPayload::TimerCompleted { seq }),
                        until_time,
                        base_time,
                    )
                    .await?;
                Ok(HistoryEvent::new(EventPayload::TimerScheduled {
                    seq,
                    until_time,
                }))
            }

            WorkflowCommand::StartChildWorkflow { seq, name, input } => {
                self.client
                    .start_execution(StartExecutionRequest {
                        workflow: name.clone(),
                        execution_name: Some(execution_id.name().child(seq)),
                        input: input.clone(),
                        timeout: None,
                        parent: Some(ParentRef {
                            execution_id: execution_id.clone(),
                            seq,
                        }),
                    })
                    .await?;
                Ok(HistoryEvent::new(EventPayload::ChildWorkflowScheduled {
                    seq,
                    name,
                    input,
                }))
            }

            WorkflowCommand::SendSignal {
                seq,
                target,
                signal_id,
                payload,
            } => {
                let target_id = target.resolve(execution_id);
                // Deterministic id doubles as the delivery de-dup key, so a
                // re-executed send cannot deliver twice.
                let dedup_key = format!("{execution_id}/{seq}");
                let received = HistoryEvent::new(EventPayload::SignalReceived {
                    id: dedup_key.clone(),
                    signal_id: signal_id.clone(),
                    payload: payload.clone(),
                });
                self.queue
                    .submit_deduplicated(&dedup_key, WorkflowTask::single(target_id.clone(), received))
                    .await?;
                Ok(HistoryEvent::new(EventPayload::SignalSent {
                    seq,
                    execution_id: target_id,
                    signal_id,
                    payload,
                }))
            }

            WorkflowCommand::EmitEvents { seq, events } => {
                self.events.emit(&events).await?;
                Ok(HistoryEvent::new(EventPayload::EventsEmitted { seq, events }))
            }

            WorkflowCommand::ExpectSignal {
                seq,
                signal_id,
                timeout,
            } => {
                if let Some(timeout) = timeout {
                    self.timer
                        .schedule_event(
                            execution_id.clone(),
                            HistoryEvent::new(EventPayload::SignalTimedOut {
                                seq,
                                signal_id: signal_id.clone(),
                            }),
                            base_time + timeout,
                            base_time,
                        )
                        .await?;
                }
                Ok(HistoryEvent::new(EventPayload::SignalExpectStarted {
                    seq,
                    signal_id,
                }))
            }

            WorkflowCommand::StartCondition { seq, timeout } => {
                if let Some(timeout) = timeout {
                    self.timer
                        .schedule_event(
                            execution_id.clone(),
                            HistoryEvent::new(EventPayload::ConditionTimedOut { seq }),
                            base_time + timeout,
                            base_time,
                        )
                        .await?;
                }
                Ok(HistoryEvent::new(EventPayload::ConditionStarted { seq }))
            }

            WorkflowCommand::InvokeTransaction { seq, name, input } => {
                self.transactions
                    .enqueue(TransactionEnvelope {
                        execution_id: execution_id.clone(),
                        seq,
                        name: name.clone(),
                        input: input.clone(),
                    })
                    .await?;
                Ok(HistoryEvent::new(EventPayload::TransactionRequest {
                    seq,
                    name,
                    input,
                }))
            }

            WorkflowCommand::EntityOp { seq, operation } => {
                let result = self.apply_entity_op(&operation).await;
                self.submit_request_result(
                    execution_id,
                    seq,
                    result,
                    |seq, result| EventPayload::EntityRequestSucceeded { seq, result },
                    |seq, error, message| EventPayload::EntityRequestFailed {
                        seq,
                        error,
                        message,
                    },
                )
                .await?;
                Ok(HistoryEvent::new(EventPayload::EntityRequest {
                    seq,
                    operation,
                }))
            }

            WorkflowCommand::BucketOp { seq, operation } => {
                let result = self.apply_bucket_op(&operation).await;
                self.submit_request_result(
                    execution_id,
                    seq,
                    result,
                    |seq, result| EventPayload::BucketRequestSucceeded { seq, result },
                    |seq, error, message| EventPayload::BucketRequestFailed {
                        seq,
                        error,
                        message,
                    },
                )
                .await?;
                Ok(HistoryEvent::new(EventPayload::BucketRequest {
                    seq,
                    operation,
                }))
            }

            WorkflowCommand::SearchOp { seq, operation } => {
                let result = self
                    .search
                    .query(&operation)
                    .await
                    .map(Value::Array);
                self.submit_request_result(
                    execution_id,
                    seq,
                    result,
                    |seq, result| EventPayload::SearchRequestSucceeded { seq, result },
                    |seq, error, message| EventPayload::SearchRequestFailed {
                        seq,
                        error,
                        message,
                    },
                )
                .await?;
                Ok(HistoryEvent::new(EventPayload::SearchRequest {
                    seq,
                    operation,
                }))
            }
        }
    }

    async fn apply_entity_op(&self, operation: &EntityOperation) -> Result<Value> {
        match operation {
            EntityOperation::Get { key } => Ok(self
                .entities
                .get(key)
                .await?
                .map_or(Value::Null, |entry| entry.value)),
            EntityOperation::Set { key, value } => {
                self.entities.set(key, value.clone()).await?;
                Ok(Value::Null)
            }
            EntityOperation::Delete { key } => {
                self.entities.delete(key).await?;
                Ok(Value::Null)
            }
        }
    }

    async fn apply_bucket_op(&self, operation: &BucketOperation) -> Result<Value> {
        match operation {
            BucketOperation::Get { key } => Ok(self
                .buckets
                .get(key)
                .await?
                .map_or(Value::Null, |data| Value::String(BASE64.encode(&data)))),
            BucketOperation::Put { key, data } => {
                let decoded = BASE64
                    .decode(data)
                    .map_err(|e| crate::error::Error::serialization(format!(
                        "bucket payload is not base64: {e}"
                    )))?;
                self.buckets.put(key, Bytes::from(decoded)).await?;
                Ok(Value::Null)
            }
            BucketOperation::Delete { key } => {
                self.buckets.delete(key).await?;
                Ok(Value::Null)
            }
        }
    }

    /// Submits the success/failure result event for an inline store
    /// operation back to the issuing execution.
    async fn submit_request_result(
        &self,
        execution_id: &ExecutionId,
        seq: u64,
        result: Result<Value>,
        on_success: impl FnOnce(u64, Value) -> EventPayload,
        on_failure: impl FnOnce(u64, String, String) -> EventPayload,
    ) -> Result<()> {
        let payload = match result {
            Ok(value) => on_success(seq, value),
            Err(error) => on_failure(seq, "StorageError".to_string(), error.to_string()),
        };
        self.queue
            .submit(WorkflowTask::single(
                execution_id.clone(),
                HistoryEvent::new(payload),
            ))
            .await?;
        Ok(())
    }
}
