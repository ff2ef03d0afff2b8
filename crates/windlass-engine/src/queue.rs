//! Workflow-task queue abstraction.
//!
//! This module provides:
//!
//! - [`WorkflowTask`]: the queue message, a batch of events for one execution
//! - [`ExecutionQueue`]: trait for FIFO-per-execution delivery
//! - [`InMemoryExecutionQueue`]: in-memory queue for testing
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: same interface for SQS FIFO, Pub/Sub ordering
//!   keys, or local queues
//! - **Grouped FIFO**: events for one execution are delivered in order, with
//!   at most one task in flight per execution
//! - **Idempotent submission**: optional deduplication keys let retried
//!   producers submit safely

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use windlass_core::{ExecutionId, HistoryEvent};

use crate::error::{Error, Result};

/// A queue message: new events addressed to one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowTask {
    /// The target execution.
    pub execution_id: ExecutionId,
    /// New events, in delivery order.
    pub events: Vec<HistoryEvent>,
}

impl WorkflowTask {
    /// Creates a task for `execution_id` carrying `events`.
    #[must_use]
    pub fn new(execution_id: ExecutionId, events: Vec<HistoryEvent>) -> Self {
        Self {
            execution_id,
            events,
        }
    }

    /// Creates a task carrying a single event.
    #[must_use]
    pub fn single(execution_id: ExecutionId, event: HistoryEvent) -> Self {
        Self::new(execution_id, vec![event])
    }
}

/// Result of submitting a workflow task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    /// The task was enqueued.
    Enqueued,
    /// The deduplication key was seen before; nothing was enqueued.
    Deduplicated,
}

/// FIFO-per-execution delivery of workflow tasks.
///
/// ## Ordering Contract
///
/// For a given execution, events are delivered in submission order and at
/// most one received task is in flight at a time. A task must be `ack`ed
/// (success) or `nack`ed (redeliver) before the next task for the same
/// execution becomes visible. Tasks for *different* executions move
/// independently.
#[async_trait]
pub trait ExecutionQueue: Send + Sync {
    /// Submits a task.
    async fn submit(&self, task: WorkflowTask) -> Result<SubmitResult>;

    /// Submits a task with a deduplication key.
    ///
    /// A repeated key within the queue's deduplication window is dropped and
    /// reported as [`SubmitResult::Deduplicated`].
    async fn submit_deduplicated(&self, key: &str, task: WorkflowTask) -> Result<SubmitResult>;

    /// Receives up to `max_executions` tasks, one merged task per execution.
    ///
    /// Received executions are marked in flight until `ack` or `nack`.
    async fn receive(&self, max_executions: usize) -> Result<Vec<WorkflowTask>>;

    /// Acknowledges the in-flight task for an execution.
    async fn ack(&self, execution_id: &ExecutionId) -> Result<()>;

    /// Returns the in-flight task's events to the front of the queue for
    /// redelivery.
    async fn nack(&self, execution_id: &ExecutionId) -> Result<()>;

    /// Returns the approximate number of executions with pending events.
    async fn depth(&self) -> Result<usize>;
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<ExecutionId, VecDeque<HistoryEvent>>,
    // Insertion order of executions, for fair receive ordering.
    order: VecDeque<ExecutionId>,
    in_flight: HashMap<ExecutionId, Vec<HistoryEvent>>,
    dedup_keys: HashSet<String>,
}

/// In-memory grouped-FIFO queue for testing.
#[derive(Debug, Default)]
pub struct InMemoryExecutionQueue {
    state: Mutex<QueueState>,
}

/// Converts a lock poison error to a queue error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::queue("lock poisoned")
}

impl InMemoryExecutionQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(state: &mut QueueState, task: WorkflowTask) {
        let entry = state.pending.entry(task.execution_id.clone()).or_default();
        if entry.is_empty() && !state.order.contains(&task.execution_id) {
            state.order.push_back(task.execution_id.clone());
        }
        entry.extend(task.events);
    }
}

#[async_trait]
impl ExecutionQueue for InMemoryExecutionQueue {
    async fn submit(&self, task: WorkflowTask) -> Result<SubmitResult> {
        let mut state = self.state.lock().map_err(poison_err)?;
        Self::push(&mut state, task);
        Ok(SubmitResult::Enqueued)
    }

    async fn submit_deduplicated(&self, key: &str, task: WorkflowTask) -> Result<SubmitResult> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if !state.dedup_keys.insert(key.to_string()) {
            return Ok(SubmitResult::Deduplicated);
        }
        Self::push(&mut state, task);
        Ok(SubmitResult::Enqueued)
    }

    async fn receive(&self, max_executions: usize) -> Result<Vec<WorkflowTask>> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let mut received = Vec::new();
        let mut requeue = Vec::new();

        while received.len() < max_executions {
            let Some(execution_id) = state.order.pop_front() else {
                break;
            };
            if state.in_flight.contains_key(&execution_id) {
                // Still being worked on; revisit once acked.
                requeue.push(execution_id);
                continue;
            }
            let Some(events) = state.pending.remove(&execution_id) else {
                continue;
            };
            if events.is_empty() {
                continue;
            }
            let events: Vec<HistoryEvent> = events.into();
            state
                .in_flight
                .insert(execution_id.clone(), events.clone());
            received.push(WorkflowTask::new(execution_id, events));
        }

        for execution_id in requeue {
            state.order.push_back(execution_id);
        }
        Ok(received)
    }

    async fn ack(&self, execution_id: &ExecutionId) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.in_flight.remove(execution_id);
        if state
            .pending
            .get(execution_id)
            .is_some_and(|events| !events.is_empty())
            && !state.order.contains(execution_id)
        {
            state.order.push_back(execution_id.clone());
        }
        Ok(())
    }

    async fn nack(&self, execution_id: &ExecutionId) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let Some(events) = state.in_flight.remove(execution_id) else {
            return Ok(());
        };
        let entry = state.pending.entry(execution_id.clone()).or_default();
        for event in events.into_iter().rev() {
            entry.push_front(event);
        }
        if !state.order.contains(execution_id) {
            state.order.push_back(execution_id.clone());
        }
        Ok(())
    }

    async fn depth(&self) -> Result<usize> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state
            .pending
            .values()
            .filter(|events| !events.is_empty())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windlass_core::event::EventPayload;

    fn event(seq: u64) -> HistoryEvent {
        HistoryEvent::new(EventPayload::TimerCompleted { seq })
    }

    fn id(raw: &str) -> ExecutionId {
        raw.parse().unwrap()
    }

    #[tokio::test]
    async fn events_for_one_execution_arrive_in_order() {
        let queue = InMemoryExecutionQueue::new();
        let exec = id("wf/run");
        queue
            .submit(WorkflowTask::single(exec.clone(), event(0)))
            .await
            .unwrap();
        queue
            .submit(WorkflowTask::single(exec.clone(), event(1)))
            .await
            .unwrap();

        let tasks = queue.receive(10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].execution_id, exec);
        let seqs: Vec<u64> = tasks[0]
            .events
            .iter()
            .filter_map(|e| e.payload.seq())
            .collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[tokio::test]
    async fn one_task_in_flight_per_execution() {
        let queue = InMemoryExecutionQueue::new();
        let exec = id("wf/run");
        queue
            .submit(WorkflowTask::single(exec.clone(), event(0)))
            .await
            .unwrap();
        let first = queue.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);

        // A new event arrives while the first task is in flight.
        queue
            .submit(WorkflowTask::single(exec.clone(), event(1)))
            .await
            .unwrap();
        assert!(queue.receive(10).await.unwrap().is_empty());

        queue.ack(&exec).await.unwrap();
        let second = queue.receive(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].events[0].payload.seq(), Some(1));
    }

    #[tokio::test]
    async fn nack_redelivers_at_the_front() {
        let queue = InMemoryExecutionQueue::new();
        let exec = id("wf/run");
        queue
            .submit(WorkflowTask::single(exec.clone(), event(0)))
            .await
            .unwrap();
        let first = queue.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);

        queue
            .submit(WorkflowTask::single(exec.clone(), event(1)))
            .await
            .unwrap();
        queue.nack(&exec).await.unwrap();

        let redelivered = queue.receive(10).await.unwrap();
        let seqs: Vec<u64> = redelivered[0]
            .events
            .iter()
            .filter_map(|e| e.payload.seq())
            .collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[tokio::test]
    async fn dedup_key_suppresses_duplicates() {
        let queue = InMemoryExecutionQueue::new();
        let exec = id("wf/run");
        let first = queue
            .submit_deduplicated("sender/3", WorkflowTask::single(exec.clone(), event(0)))
            .await
            .unwrap();
        assert_eq!(first, SubmitResult::Enqueued);

        let second = queue
            .submit_deduplicated("sender/3", WorkflowTask::single(exec.clone(), event(0)))
            .await
            .unwrap();
        assert_eq!(second, SubmitResult::Deduplicated);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn different_executions_move_independently() {
        let queue = InMemoryExecutionQueue::new();
        queue
            .submit(WorkflowTask::single(id("wf/a"), event(0)))
            .await
            .unwrap();
        queue
            .submit(WorkflowTask::single(id("wf/b"), event(0)))
            .await
            .unwrap();

        let tasks = queue.receive(10).await.unwrap();
        assert_eq!(tasks.len(), 2);
    }
}
