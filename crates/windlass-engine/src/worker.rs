//! The task worker: claims dispatched tasks and runs user handlers.
//!
//! A worker claims `(executionId, seq, retry)` through the execution store's
//! first-writer-wins claim table, so a redelivered envelope is executed at
//! most once per retry. Handlers run inside an instrumented scope that
//! exposes a service client (signals, event emission, child workflow start)
//! and the task's callback token; the heartbeat monitor registered for the
//! task is released on every exit path.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use metrics::{counter, histogram};
use serde_json::Value;

use windlass_core::{ExecutionId, HistoryEvent, TaskToken};
use windlass_core::event::EventPayload;

use crate::dispatch::{TaskEnvelope, TaskQueue};
use crate::error::{Result, codes};
use crate::metrics::{labels, names};
use crate::queue::{ExecutionQueue, WorkflowTask};
use crate::registry::Registry;
use crate::service::EngineClient;
use crate::store::{ClaimResult, ExecutionStore};
use crate::timer::{TimerRequest, TimerService};

/// What a task handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// The task finished with this result.
    Complete(Value),
    /// The async sentinel: no result event is emitted now. The handler has
    /// arranged for a later `SendTaskSuccess` / `SendTaskFailure` call
    /// carrying the task token.
    Async,
}

/// Per-invocation context handed to a task handler.
#[derive(Clone)]
pub struct TaskContext {
    execution_id: ExecutionId,
    seq: u64,
    retry: u32,
    token: String,
    client: Arc<dyn EngineClient>,
}

impl TaskContext {
    /// The execution this task belongs to.
    #[must_use]
    pub const fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// The task's command sequence number.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// The attempt number (0-indexed).
    #[must_use]
    pub const fn retry(&self) -> u32 {
        self.retry
    }

    /// The opaque callback token for out-of-band completion.
    #[must_use]
    pub fn task_token(&self) -> &str {
        &self.token
    }

    /// The service client for signals, events, and child workflow starts.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn EngineClient> {
        &self.client
    }
}

/// Claims dispatched tasks and runs their handlers.
pub struct TaskWorker {
    executions: Arc<dyn ExecutionStore>,
    queue: Arc<dyn ExecutionQueue>,
    timer: Arc<TimerService>,
    registry: Arc<Registry>,
    client: Arc<dyn EngineClient>,
    worker_id: String,
}

impl TaskWorker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        queue: Arc<dyn ExecutionQueue>,
        timer: Arc<TimerService>,
        registry: Arc<Registry>,
        client: Arc<dyn EngineClient>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            executions,
            queue,
            timer,
            registry,
            client,
            worker_id: worker_id.into(),
        }
    }

    /// Dequeues and handles one envelope; returns false when the queue was
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the dequeue or the handling fails.
    pub async fn poll_once(&self, tasks: &dyn TaskQueue) -> Result<bool> {
        let Some(envelope) = tasks.dequeue().await? else {
            return Ok(false);
        };
        self.handle(envelope).await?;
        Ok(true)
    }

    /// Handles one dispatched task envelope.
    ///
    /// # Errors
    ///
    /// Returns an error on store, timer, or queue faults; handler failures
    /// are reported as `TaskFailed` result events, not errors.
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            execution_id = %envelope.execution_id,
            seq = envelope.seq,
            task = %envelope.name,
            retry = envelope.retry,
            worker_id = %self.worker_id,
        )
    )]
    pub async fn handle(&self, envelope: TaskEnvelope) -> Result<()> {
        let now = Utc::now();
        let claim = self
            .executions
            .claim_task(
                &envelope.execution_id,
                envelope.seq,
                envelope.retry,
                &self.worker_id,
                now,
            )
            .await?;
        if let ClaimResult::AlreadyClaimed { claimer } = claim {
            counter!(names::TASK_CLAIMS_TOTAL, labels::RESULT => "rejected").increment(1);
            tracing::info!(
                claim_key = %envelope.claim_key(),
                %claimer,
                "task already claimed, skipping"
            );
            return Ok(());
        }
        counter!(names::TASK_CLAIMS_TOTAL, labels::RESULT => "acquired").increment(1);

        let monitor = match envelope.heartbeat_timeout_secs {
            Some(secs) => {
                let window = Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX));
                Some(
                    self.timer
                        .start_timer(
                            TimerRequest::HeartbeatMonitor {
                                execution_id: envelope.execution_id.clone(),
                                seq: envelope.seq,
                                heartbeat_timeout: window,
                                due_at: now + window,
                            },
                            now,
                        )
                        .await?,
                )
            }
            None => None,
        };

        let result_event = self.invoke(&envelope).await?;

        // Scope teardown. The monitor stays armed for the async sentinel:
        // the task keeps running out-of-band and the heartbeat window is
        // its only liveness check.
        if result_event.is_some() {
            if let Some(schedule_id) = monitor {
                self.timer.clear_schedule(&schedule_id).await?;
            }
        }

        if let Some(payload) = result_event {
            self.queue
                .submit(WorkflowTask::single(
                    envelope.execution_id,
                    HistoryEvent::new(payload),
                ))
                .await?;
        }
        Ok(())
    }

    /// Runs the handler; returns the result event to deliver, or `None` for
    /// the async sentinel.
    async fn invoke(&self, envelope: &TaskEnvelope) -> Result<Option<EventPayload>> {
        let Some(handler) = self.registry.task(&envelope.name) else {
            return Ok(Some(EventPayload::TaskFailed {
                seq: envelope.seq,
                error: codes::TASK_NOT_FOUND.to_string(),
                message: format!("no task registered under '{}'", envelope.name),
            }));
        };

        let token = TaskToken::new(envelope.execution_id.clone(), envelope.seq).encode()?;
        let ctx = TaskContext {
            execution_id: envelope.execution_id.clone(),
            seq: envelope.seq,
            retry: envelope.retry,
            token,
            client: Arc::clone(&self.client),
        };

        let started = Instant::now();
        let output = handler(envelope.input.clone(), ctx).await;
        let result_label = match &output {
            Ok(TaskOutput::Complete(_)) => "succeeded",
            Ok(TaskOutput::Async) => "async",
            Err(_) => "failed",
        };
        histogram!(names::TASK_DURATION_SECONDS, labels::RESULT => result_label)
            .record(started.elapsed().as_secs_f64());

        Ok(match output {
            Ok(TaskOutput::Complete(result)) => Some(EventPayload::TaskSucceeded {
                seq: envelope.seq,
                result,
            }),
            Ok(TaskOutput::Async) => None,
            Err(failure) => {
                tracing::info!(error = %failure, "task handler failed");
                Some(EventPayload::TaskFailed {
                    seq: envelope.seq,
                    error: failure.error,
                    message: failure.message,
                })
            }
        })
    }
}
