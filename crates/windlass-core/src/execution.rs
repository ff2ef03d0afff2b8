//! Execution metadata records.
//!
//! An execution is one running (or completed) instance of a workflow. The
//! record here is the flat row kept in the execution store; the authoritative
//! state lives in the history log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{ExecutionId, WorkflowName};

/// Reference from a child execution back to the command that spawned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    /// The spawning execution.
    pub execution_id: ExecutionId,
    /// Sequence of the parent's `ChildWorkflowScheduled` command.
    pub seq: u64,
}

/// The status of an execution.
///
/// Status is monotonic: `InProgress` transitions to exactly one terminal
/// status and never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Execution is running (or waiting on external results).
    InProgress,

    /// Execution completed successfully.
    Succeeded,

    /// Execution failed with an error.
    Failed,

    /// Execution exceeded its workflow-level timeout.
    TimedOut,
}

impl ExecutionStatus {
    /// Returns true if this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Metadata for one execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    /// Unique identifier: `{workflowName}/{executionName}`.
    pub id: ExecutionId,

    /// Workflow this execution runs.
    pub workflow_name: WorkflowName,

    /// Current status.
    pub status: ExecutionStatus,

    /// Workflow input.
    pub input: Value,

    /// Hex-encoded hash of the canonical input, for idempotent starts.
    pub input_hash: String,

    /// When the execution started.
    pub start_time: DateTime<Utc>,

    /// When the execution reached a terminal status. Present iff terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Workflow output, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Stable error identifier, present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Human-readable failure description, present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Reference to the spawning execution. Present iff this is a child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
}

impl Execution {
    /// Creates a new in-progress execution record.
    #[must_use]
    pub fn new(
        id: ExecutionId,
        input: Value,
        input_hash: impl Into<String>,
        start_time: DateTime<Utc>,
        parent: Option<ParentRef>,
    ) -> Self {
        let workflow_name = id.workflow().clone();
        Self {
            id,
            workflow_name,
            status: ExecutionStatus::InProgress,
            input,
            input_hash: input_hash.into(),
            start_time,
            end_time: None,
            result: None,
            error: None,
            message: None,
            parent,
        }
    }

    /// Returns true if the execution has reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
