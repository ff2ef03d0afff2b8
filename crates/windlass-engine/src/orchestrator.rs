//! Drives executions from workflow-task batches.
//!
//! For each execution in a batch the orchestrator loads history, dedup-merges
//! the task's new events, runs the workflow executor, fans the resulting
//! commands out through the command executor, and persists the run:
//! history append, journal append, optimistic terminal-status update, and,
//! for child executions, the parent's `ChildWorkflow*` result event.
//!
//! Partial failure is per execution: one execution's orchestration fault is
//! logged and its id reported; the rest of the batch proceeds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use metrics::{counter, histogram};
use serde_json::Value;

use windlass_core::event::EventPayload;
use windlass_core::execution::ParentRef;
use windlass_core::{ExecutionId, ExecutionStatus, HistoryEvent};

use crate::command_executor::CommandExecutor;
use crate::error::{Failure, Result, codes};
use crate::executor::{RunResult, WorkflowExecutor, WorkflowInfo};
use crate::metrics::{TimingGuard, labels, names};
use crate::queue::{ExecutionQueue, WorkflowTask};
use crate::registry::Registry;
use crate::store::{
    ExecutionStore, HistoryStore, JournalStore, TerminalOutcome, UpdateResult,
};
use crate::timer::TimerService;

/// The result of orchestrating one batch.
#[derive(Debug, Default)]
pub struct OrchestratorOutcome {
    /// Executions whose orchestration failed and whose tasks should be
    /// redelivered.
    pub failed_execution_ids: Vec<ExecutionId>,
}

/// How a run ended, for terminal bookkeeping.
enum Terminal {
    Succeeded(Value),
    Failed(Failure),
    TimedOut,
}

impl Terminal {
    fn from_run(result: &RunResult) -> Option<Self> {
        match result {
            RunResult::Pending => None,
            RunResult::Succeeded(output) => Some(Self::Succeeded(output.clone())),
            RunResult::Failed(failure) => Some(Self::Failed(failure.clone())),
            RunResult::TimedOut => Some(Self::TimedOut),
        }
    }

    fn outcome(&self, end_time: chrono::DateTime<chrono::Utc>) -> TerminalOutcome {
        match self {
            Self::Succeeded(output) => TerminalOutcome {
                status: ExecutionStatus::Succeeded,
                end_time,
                result: Some(output.clone()),
                error: None,
                message: None,
            },
            Self::Failed(failure) => TerminalOutcome {
                status: ExecutionStatus::Failed,
                end_time,
                result: None,
                error: Some(failure.error.clone()),
                message: Some(failure.message.clone()),
            },
            Self::TimedOut => TerminalOutcome {
                status: ExecutionStatus::TimedOut,
                end_time,
                result: None,
                error: Some(codes::TIMEOUT.to_string()),
                message: Some("workflow exceeded its timeout".to_string()),
            },
        }
    }

    /// The terminal lifecycle event to append, if one is still missing.
    ///
    /// A timed-out run appends nothing: the preempting `WorkflowTimedOut`
    /// is already part of history.
    fn lifecycle_event(&self) -> Option<HistoryEvent> {
        match self {
            Self::Succeeded(output) => Some(HistoryEvent::new(EventPayload::WorkflowSucceeded {
                id: EventPayload::fresh_id(),
                output: output.clone(),
            })),
            Self::Failed(failure) => Some(HistoryEvent::new(EventPayload::WorkflowFailed {
                id: EventPayload::fresh_id(),
                error: failure.error.clone(),
                message: failure.message.clone(),
            })),
            Self::TimedOut => None,
        }
    }

    /// The result event delivered to the parent, keyed by the parent's
    /// `ChildWorkflowScheduled` seq.
    fn child_result(&self, seq: u64) -> EventPayload {
        match self {
            Self::Succeeded(output) => EventPayload::ChildWorkflowSucceeded {
                seq,
                result: output.clone(),
            },
            Self::Failed(failure) => EventPayload::ChildWorkflowFailed {
                seq,
                error: failure.error.clone(),
                message: failure.message.clone(),
            },
            Self::TimedOut => EventPayload::ChildWorkflowFailed {
                seq,
                error: codes::TIMEOUT.to_string(),
                message: "child workflow exceeded its timeout".to_string(),
            },
        }
    }

    const fn metric_label(&self) -> &'static str {
        match self {
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Fields pulled from an execution's `WorkflowStarted` event.
struct StartedFields {
    workflow_name: windlass_core::WorkflowName,
    input: Value,
    timeout_time: Option<chrono::DateTime<chrono::Utc>>,
    parent: Option<ParentRef>,
    start_time: chrono::DateTime<chrono::Utc>,
}

fn find_started(events: &[HistoryEvent]) -> Option<StartedFields> {
    events.iter().find_map(|event| match &event.payload {
        EventPayload::WorkflowStarted {
            workflow_name,
            input,
            timeout_time,
            parent,
            ..
        } => Some(StartedFields {
            workflow_name: workflow_name.clone(),
            input: input.clone(),
            timeout_time: *timeout_time,
            parent: parent.clone(),
            start_time: event.timestamp,
        }),
        _ => None,
    })
}

/// Drains workflow-task batches and advances their executions.
pub struct Orchestrator {
    history: Arc<dyn HistoryStore>,
    executions: Arc<dyn ExecutionStore>,
    queue: Arc<dyn ExecutionQueue>,
    journal: Arc<dyn JournalStore>,
    timer: Arc<TimerService>,
    commands: Arc<CommandExecutor>,
    registry: Arc<Registry>,
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        history: Arc<dyn HistoryStore>,
        executions: Arc<dyn ExecutionStore>,
        queue: Arc<dyn ExecutionQueue>,
        journal: Arc<dyn JournalStore>,
        timer: Arc<TimerService>,
        commands: Arc<CommandExecutor>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            history,
            executions,
            queue,
            journal,
            timer,
            commands,
            registry,
        }
    }

    /// Orchestrates a batch of workflow tasks.
    ///
    /// Tasks are grouped by execution id (order preserved within a group)
    /// and the groups are advanced concurrently.
    pub async fn orchestrate(&self, tasks: Vec<WorkflowTask>) -> OrchestratorOutcome {
        let mut order: Vec<ExecutionId> = Vec::new();
        let mut groups: HashMap<ExecutionId, Vec<HistoryEvent>> = HashMap::new();
        for task in tasks {
            let entry = groups.entry(task.execution_id.clone()).or_default();
            if entry.is_empty() {
                order.push(task.execution_id.clone());
            }
            entry.extend(task.events);
        }

        let runs = order.into_iter().map(|execution_id| {
            let events = groups.remove(&execution_id).unwrap_or_default();
            async move {
                let result = self.orchestrate_execution(&execution_id, events).await;
                (execution_id, result)
            }
        });

        let mut outcome = OrchestratorOutcome::default();
        for (execution_id, result) in join_all(runs).await {
            if let Err(error) = result {
                tracing::warn!(%execution_id, %error, "orchestration failed");
                outcome.failed_execution_ids.push(execution_id);
            }
        }
        outcome
    }

    /// Receives a batch from the queue, orchestrates it, and acks/nacks.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue itself fails.
    pub async fn run_once(&self, batch_size: usize) -> Result<OrchestratorOutcome> {
        let tasks = self.queue.receive(batch_size).await?;
        if tasks.is_empty() {
            return Ok(OrchestratorOutcome::default());
        }
        let received: Vec<ExecutionId> =
            tasks.iter().map(|task| task.execution_id.clone()).collect();

        let outcome = self.orchestrate(tasks).await;
        let failed: HashSet<&ExecutionId> = outcome.failed_execution_ids.iter().collect();
        for execution_id in &received {
            if failed.contains(execution_id) {
                self.queue.nack(execution_id).await?;
            } else {
                self.queue.ack(execution_id).await?;
            }
        }
        Ok(outcome)
    }

    /// Runs the drain loop until the task is aborted.
    pub async fn run(self: Arc<Self>, batch_size: usize, poll_interval: std::time::Duration) {
        loop {
            match self.run_once(batch_size).await {
                Ok(outcome) if outcome.failed_execution_ids.is_empty() => {}
                Ok(outcome) => {
                    tracing::warn!(
                        failed = outcome.failed_execution_ids.len(),
                        "batch finished with failed executions"
                    );
                }
                Err(error) => tracing::warn!(%error, "queue receive failed"),
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    #[tracing::instrument(skip(self, new_events), fields(execution_id = %execution_id, events = new_events.len()))]
    async fn orchestrate_execution(
        &self,
        execution_id: &ExecutionId,
        new_events: Vec<HistoryEvent>,
    ) -> Result<()> {
        let _timing = TimingGuard::new(|elapsed| {
            histogram!(names::RUN_DURATION_SECONDS).record(elapsed.as_secs_f64());
        });
        let base_time = Utc::now();

        // Late deliveries to a finished execution are dropped; the status
        // transition already happened and replaying would only append
        // duplicate terminal events.
        if let Some(execution) = self.executions.get(execution_id).await? {
            if execution.is_terminal() {
                tracing::debug!(%execution_id, "dropping events for terminal execution");
                return Ok(());
            }
        }

        let stored = self.history.read(execution_id).await?;
        let mut seen: HashSet<String> = stored.iter().map(HistoryEvent::event_id).collect();
        let fresh: Vec<HistoryEvent> = new_events
            .into_iter()
            .filter(|event| seen.insert(event.event_id()))
            .collect();
        let mut merged = stored.clone();
        merged.extend(fresh.iter().cloned());

        let Some(started) = find_started(&merged) else {
            // Without a start event there is no program to replay; fail the
            // execution terminally.
            return self
                .finish_terminal(
                    execution_id,
                    fresh,
                    &Terminal::Failed(Failure::determinism(
                        "history contains no WorkflowStarted event",
                    )),
                    None,
                    base_time,
                )
                .await;
        };

        let first_run = !stored
            .iter()
            .any(|event| matches!(event.payload, EventPayload::WorkflowRunStarted { .. }));
        if first_run {
            if let Some(timeout_time) = started.timeout_time {
                self.timer
                    .schedule_event(
                        execution_id.clone(),
                        HistoryEvent::at(
                            timeout_time,
                            EventPayload::WorkflowTimedOut {
                                id: EventPayload::fresh_id(),
                            },
                        ),
                        timeout_time,
                        base_time,
                    )
                    .await?;
            }
        }

        let Some(handler) = self.registry.workflow(&started.workflow_name) else {
            return self
                .finish_terminal(
                    execution_id,
                    fresh,
                    &Terminal::Failed(Failure::new(
                        codes::WORKFLOW_NOT_FOUND,
                        format!(
                            "no workflow registered under '{}'",
                            started.workflow_name
                        ),
                    )),
                    started.parent,
                    base_time,
                )
                .await;
        };

        let info = WorkflowInfo {
            workflow_name: started.workflow_name.clone(),
            execution_id: execution_id.clone(),
            start_time: started.start_time,
            parent: started.parent.clone(),
        };
        let run = WorkflowExecutor::new(info, base_time).run(&handler, started.input, &merged);

        let run_label = match &run.result {
            RunResult::Pending => "pending",
            _ => Terminal::from_run(&run.result).map_or("pending", |t| t.metric_label()),
        };
        counter!(names::WORKFLOW_RUNS_TOTAL, labels::RESULT => run_label).increment(1);

        // Fan the commands out concurrently; every side effect of this run
        // must land (or fail the run) before the run is finalized.
        let executed = join_all(run.commands.into_iter().map(|command| {
            self.commands.execute(execution_id, command, base_time)
        }))
        .await;
        let mut scheduled: Vec<HistoryEvent> = Vec::with_capacity(executed.len());
        for event in executed {
            scheduled.push(event?);
        }
        scheduled.sort_by_key(|event| event.payload.seq());

        let mut to_append = vec![HistoryEvent::at(
            base_time,
            EventPayload::WorkflowRunStarted {
                id: EventPayload::fresh_id(),
            },
        )];
        to_append.extend(fresh);
        to_append.extend(scheduled);
        to_append.push(HistoryEvent::new(EventPayload::WorkflowRunCompleted {
            id: EventPayload::fresh_id(),
        }));

        match Terminal::from_run(&run.result) {
            Some(terminal) => {
                self.finish_terminal(
                    execution_id,
                    to_append,
                    &terminal,
                    started.parent,
                    base_time,
                )
                .await
            }
            None => {
                self.history.append(execution_id, &to_append).await?;
                self.journal.append(execution_id, &to_append).await?;
                Ok(())
            }
        }
    }

    /// Persists a terminal run: history, journal, the optimistic status
    /// update, and the parent's child-result event.
    async fn finish_terminal(
        &self,
        execution_id: &ExecutionId,
        mut to_append: Vec<HistoryEvent>,
        terminal: &Terminal,
        parent: Option<ParentRef>,
        end_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        if let Some(event) = terminal.lifecycle_event() {
            to_append.push(event);
        }
        self.history.append(execution_id, &to_append).await?;
        self.journal.append(execution_id, &to_append).await?;

        let update = self
            .executions
            .complete(execution_id, &terminal.outcome(end_time))
            .await?;
        match update {
            UpdateResult::Success => {
                if let Some(parent) = parent {
                    self.queue
                        .submit(WorkflowTask::single(
                            parent.execution_id,
                            HistoryEvent::new(terminal.child_result(parent.seq)),
                        ))
                        .await?;
                }
            }
            UpdateResult::NotFound => {
                tracing::warn!(%execution_id, "terminal update for unknown execution");
            }
            UpdateResult::StatusMismatch { actual } => {
                // Another run already finalized this execution; the
                // optimistic condition makes this attempt a no-op.
                tracing::debug!(%execution_id, ?actual, "execution already terminal");
            }
        }
        Ok(())
    }
}
