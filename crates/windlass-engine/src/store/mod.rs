//! Pluggable storage for engine state.
//!
//! The traits here define the persistence layer for histories, execution
//! metadata, task claims, timer schedules, entities, buckets, search
//! documents, and the event journal.
//!
//! ## Design Principles
//!
//! - **Conditional-write semantics**: status transitions and task claims use
//!   compare-and-swap style conditions to prevent races
//! - **Per-execution serialization**: history writers are serialized by the
//!   FIFO execution queue, so stores never see concurrent writers for the
//!   same execution
//! - **Testability**: in-memory implementations for testing; durable
//!   backends (object stores, key-value tables) for production

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use windlass_core::event::SearchOperation;
use windlass_core::{Execution, ExecutionId, ExecutionStatus, HistoryEvent, WorkflowName};

use crate::error::{Error, Result};

/// Result of a conditional create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutResult {
    /// The record was created.
    Created,
    /// A record with the same key already exists.
    AlreadyExists,
}

/// Result of an optimistic terminal-status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResult {
    /// The transition was applied.
    Success,
    /// The execution does not exist.
    NotFound,
    /// The execution was not `IN_PROGRESS`.
    StatusMismatch {
        /// The status that was actually found.
        actual: ExecutionStatus,
    },
}

impl UpdateResult {
    /// Returns true if the transition was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result of a task claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// This caller owns the claim.
    Acquired,
    /// Another caller claimed the same `(executionId, seq, retry)` first.
    AlreadyClaimed {
        /// The worker that holds the claim.
        claimer: String,
    },
}

/// The terminal fields written when an execution completes.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalOutcome {
    /// The terminal status.
    pub status: ExecutionStatus,
    /// When the execution ended.
    pub end_time: DateTime<Utc>,
    /// Workflow output, on success.
    pub result: Option<Value>,
    /// Stable error identifier, on failure.
    pub error: Option<String>,
    /// Human-readable failure description, on failure.
    pub message: Option<String>,
}

/// Pagination request: page size plus an opaque continuation token.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    /// Maximum items to return.
    pub size: usize,
    /// Continuation token from a previous page, if any.
    pub token: Option<String>,
}

impl PageRequest {
    /// Creates a first-page request.
    #[must_use]
    pub const fn first(size: usize) -> Self {
        Self { size, token: None }
    }
}

/// One page of results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The items in this page.
    pub items: Vec<T>,
    /// Continuation token for the next page, absent on the last page.
    pub next_token: Option<String>,
}

/// Filters for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    /// Only executions with this status.
    pub status: Option<ExecutionStatus>,
    /// Only executions of this workflow.
    pub workflow_name: Option<WorkflowName>,
}

/// Append-only per-execution event log with blob read/write.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Reads the full history for an execution, in append order.
    ///
    /// Returns an empty vector if the execution has no history yet.
    async fn read(&self, execution_id: &ExecutionId) -> Result<Vec<HistoryEvent>>;

    /// Appends events to an execution's history.
    async fn append(&self, execution_id: &ExecutionId, events: &[HistoryEvent]) -> Result<()>;
}

/// Encodes history events as a newline-delimited JSON blob.
///
/// # Errors
///
/// Returns a serialization error if an event cannot be encoded.
pub fn encode_history(events: &[HistoryEvent]) -> Result<Bytes> {
    let mut out = Vec::new();
    for event in events {
        let line = serde_json::to_vec(event).map_err(|e| {
            Error::serialization(format!("failed to encode history event: {e}"))
        })?;
        out.extend_from_slice(&line);
        out.push(b'\n');
    }
    Ok(Bytes::from(out))
}

/// Decodes a newline-delimited JSON history blob.
///
/// # Errors
///
/// Returns a serialization error if a line is not a valid event.
pub fn decode_history(blob: &Bytes) -> Result<Vec<HistoryEvent>> {
    blob.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_slice(line).map_err(|e| {
                Error::serialization(format!("failed to decode history event: {e}"))
            })
        })
        .collect()
}

/// Execution metadata index plus the task claim table.
///
/// Claims live with the execution store because both share the same
/// conditional-write primitive and the heartbeat path needs the execution's
/// terminal status to report cancellation.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Creates an execution record if none exists.
    async fn create(&self, execution: &Execution) -> Result<PutResult>;

    /// Gets an execution by id.
    async fn get(&self, execution_id: &ExecutionId) -> Result<Option<Execution>>;

    /// Applies a terminal outcome if the execution is still `IN_PROGRESS`.
    ///
    /// The optimistic condition makes duplicate terminal transitions no-ops:
    /// the first writer wins and later attempts observe `StatusMismatch`.
    async fn complete(
        &self,
        execution_id: &ExecutionId,
        outcome: &TerminalOutcome,
    ) -> Result<UpdateResult>;

    /// Lists executions matching `filter`, paged.
    async fn list(&self, filter: &ExecutionFilter, page: &PageRequest) -> Result<Page<Execution>>;

    // --- Task claims ---

    /// Attempts to claim `(executionId, seq, retry)` for `claimer`.
    ///
    /// First writer wins; the claim row records the claimer and claim time.
    async fn claim_task(
        &self,
        execution_id: &ExecutionId,
        seq: u64,
        retry: u32,
        claimer: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult>;

    /// Records a heartbeat timestamp on the claim row.
    async fn record_heartbeat(
        &self,
        execution_id: &ExecutionId,
        seq: u64,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns the most recent heartbeat for a claim, if any was recorded.
    async fn last_heartbeat(
        &self,
        execution_id: &ExecutionId,
        seq: u64,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// Payload delivered when a timer schedule fires.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerPayload {
    /// Submit this event to the execution's queue.
    Event(HistoryEvent),
    /// Check the task's heartbeat and fail it if the window lapsed.
    HeartbeatMonitor {
        /// Sequence of the monitored task.
        seq: u64,
        /// Maximum gap between heartbeats.
        heartbeat_timeout: Duration,
    },
}

/// A scheduled timer row.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerScheduleRow {
    /// Opaque schedule id, unique per execution.
    pub id: String,
    /// Execution the payload is addressed to.
    pub execution_id: ExecutionId,
    /// When the schedule fires.
    pub due_time: DateTime<Utc>,
    /// What to deliver on fire.
    pub payload: TimerPayload,
}

/// Long-tier timer schedule storage.
#[async_trait]
pub trait TimerStore: Send + Sync {
    /// Stores a schedule row.
    async fn put(&self, schedule: &TimerScheduleRow) -> Result<()>;

    /// Deletes a schedule row; deleting an unknown id is a no-op.
    async fn delete(&self, schedule_id: &str) -> Result<()>;

    /// Returns and removes all rows with `due_time <= now`.
    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<TimerScheduleRow>>;
}

/// A versioned entity value.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    /// The stored value.
    pub value: Value,
    /// Monotonic version, starting at 1.
    pub version: u64,
}

/// One item in a conditional multi-write.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactItem {
    /// Write `value` at `key` if the current version matches.
    Put {
        /// Entity key.
        key: String,
        /// Value to store.
        value: Value,
        /// Expected current version; `None` asserts the key is absent.
        expect_version: Option<u64>,
    },
    /// Delete `key` if the current version matches.
    Delete {
        /// Entity key.
        key: String,
        /// Expected current version; `None` asserts the key is absent.
        expect_version: Option<u64>,
    },
    /// Assert `key` is unchanged without writing it.
    Check {
        /// Entity key.
        key: String,
        /// Expected current version; `None` asserts the key is absent.
        expect_version: Option<u64>,
    },
}

/// Result of a conditional multi-write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactResult {
    /// All conditions held and all writes were applied atomically.
    Committed,
    /// A condition failed; nothing was applied.
    Conflict {
        /// The first key whose condition failed.
        key: String,
    },
}

impl TransactResult {
    /// Returns true if the write committed.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Versioned key-value entity storage with conditional multi-writes.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Reads the value and version at `key`.
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Writes `value` at `key` unconditionally, returning the new version.
    async fn set(&self, key: &str, value: Value) -> Result<u64>;

    /// Deletes `key` unconditionally; deleting an unknown key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Applies a conditional multi-write atomically.
    async fn transact(&self, items: &[TransactItem]) -> Result<TransactResult>;
}

/// Blob storage addressed by key.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Reads the blob at `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Writes a blob at `key`.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Deletes the blob at `key`; deleting an unknown key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Simple field-match search index.
#[async_trait]
pub trait SearchStore: Send + Sync {
    /// Indexes a document under `index` with the given id.
    async fn put_document(&self, index: &str, id: &str, document: Value) -> Result<()>;

    /// Returns all documents in the operation's index whose field matches.
    async fn query(&self, operation: &SearchOperation) -> Result<Vec<Value>>;
}

/// A persisted journal record: `pk = executionId`, `sk = timestamp#eventId`.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    /// Execution the event belongs to.
    pub execution_id: ExecutionId,
    /// Sort key: `{timestamp}#{eventId}`.
    pub sort_key: String,
    /// The recorded event.
    pub event: HistoryEvent,
}

impl JournalRecord {
    /// Builds the record for an event.
    #[must_use]
    pub fn new(execution_id: ExecutionId, event: HistoryEvent) -> Self {
        let sort_key = format!(
            "{}#{}",
            event.timestamp.to_rfc3339(),
            event.event_id()
        );
        Self {
            execution_id,
            sort_key,
            event,
        }
    }
}

/// Append-only journal of produced events, for audit and fan-out consumers.
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Appends events for an execution.
    async fn append(&self, execution_id: &ExecutionId, events: &[HistoryEvent]) -> Result<()>;

    /// Reads all records for an execution in sort-key order.
    async fn read(&self, execution_id: &ExecutionId) -> Result<Vec<JournalRecord>>;
}
