//! Dispatch abstraction for task and transaction workers.
//!
//! This module provides:
//!
//! - [`TaskEnvelope`] / [`TransactionEnvelope`]: serializable dispatch
//!   payloads
//! - [`TaskQueue`] / [`TransactionQueue`]: traits for enqueueing work to
//!   worker backends
//! - [`InMemoryTaskQueue`] / [`InMemoryTransactionQueue`]: in-memory queues
//!   for testing
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: same interface for hosted queues or local workers
//! - **Structured payloads**: JSON-serializable envelopes
//! - **At-least-once**: workers deduplicate via the task claim table, not
//!   the queue

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use windlass_core::ExecutionId;

use crate::error::{Error, Result};

/// Envelope for a task dispatched to the task worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    /// Execution the task belongs to.
    pub execution_id: ExecutionId,
    /// Sequence of the `TaskScheduled` command.
    pub seq: u64,
    /// Task handler name.
    pub name: String,
    /// Task input.
    pub input: Value,
    /// Attempt number (0-indexed).
    pub retry: u32,
    /// When the task was dispatched.
    pub scheduled_time: DateTime<Utc>,
    /// Heartbeat window in seconds, when the task must heartbeat.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_secs: Option<u64>,
}

impl TaskEnvelope {
    /// Returns the claim key `(executionId, seq, retry)` rendered for logs.
    #[must_use]
    pub fn claim_key(&self) -> String {
        format!("{}#{}#{}", self.execution_id, self.seq, self.retry)
    }
}

/// Envelope for a transaction dispatched to the transaction executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEnvelope {
    /// Execution awaiting the result.
    pub execution_id: ExecutionId,
    /// Sequence of the `TransactionRequest` command.
    pub seq: u64,
    /// Transaction handler name.
    pub name: String,
    /// Transaction input.
    pub input: Value,
}

/// Queue of task dispatch envelopes.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues a task for a worker to claim.
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()>;

    /// Removes and returns the next envelope, if any.
    async fn dequeue(&self) -> Result<Option<TaskEnvelope>>;

    /// Returns the queue's name or identifier.
    fn queue_name(&self) -> &str;
}

/// Queue of transaction dispatch envelopes.
#[async_trait]
pub trait TransactionQueue: Send + Sync {
    /// Enqueues a transaction request.
    async fn enqueue(&self, envelope: TransactionEnvelope) -> Result<()>;

    /// Removes and returns the next envelope, if any.
    async fn dequeue(&self) -> Result<Option<TransactionEnvelope>>;
}

/// Converts a lock poison error to a queue error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::queue("lock poisoned")
}

/// In-memory task queue for testing.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    name: String,
    envelopes: Mutex<VecDeque<TaskEnvelope>>,
}

impl InMemoryTaskQueue {
    /// Creates an empty queue with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            envelopes: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the number of queued envelopes.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn depth(&self) -> Result<usize> {
        let depth = {
            let envelopes = self.envelopes.lock().map_err(poison_err)?;
            envelopes.len()
        };
        Ok(depth)
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new("windlass-tasks")
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()> {
        let mut envelopes = self.envelopes.lock().map_err(poison_err)?;
        envelopes.push_back(envelope);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<TaskEnvelope>> {
        let mut envelopes = self.envelopes.lock().map_err(poison_err)?;
        Ok(envelopes.pop_front())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}

/// In-memory transaction queue for testing.
#[derive(Debug, Default)]
pub struct InMemoryTransactionQueue {
    envelopes: Mutex<VecDeque<TransactionEnvelope>>,
}

impl InMemoryTransactionQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionQueue for InMemoryTransactionQueue {
    async fn enqueue(&self, envelope: TransactionEnvelope) -> Result<()> {
        let mut envelopes = self.envelopes.lock().map_err(poison_err)?;
        envelopes.push_back(envelope);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<TransactionEnvelope>> {
        let mut envelopes = self.envelopes.lock().map_err(poison_err)?;
        Ok(envelopes.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(seq: u64) -> TaskEnvelope {
        TaskEnvelope {
            execution_id: "wf/run".parse().unwrap(),
            seq,
            name: "hello".into(),
            input: json!({"name": "world"}),
            retry: 0,
            scheduled_time: Utc::now(),
            heartbeat_timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn task_queue_is_fifo() {
        let queue = InMemoryTaskQueue::default();
        queue.enqueue(envelope(0)).await.unwrap();
        queue.enqueue(envelope(1)).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().unwrap().seq, 0);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().seq, 1);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let json = serde_json::to_value(envelope(3)).unwrap();
        assert_eq!(json["executionId"], "wf/run");
        assert!(json["scheduledTime"].is_string());
        assert!(json.get("heartbeatTimeoutSecs").is_none());
    }

    #[test]
    fn claim_key_includes_retry() {
        let mut env = envelope(2);
        env.retry = 4;
        assert_eq!(env.claim_key(), "wf/run#2#4");
    }
}
