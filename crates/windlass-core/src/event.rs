//! History events for execution persistence.
//!
//! Every externally observable decision an execution makes is recorded as a
//! history event. Events fall into three orthogonal categories:
//!
//! - **Lifecycle**: execution start, run boundaries, terminal outcomes
//! - **Scheduled**: intents recorded when the workflow issues a command
//! - **Result**: completions delivered into the execution from outside
//!
//! ## Event Identity
//!
//! Scheduled and result events tied to a workflow command carry a `seq`, the
//! zero-based index of the command within the execution. All other events
//! carry a ULID `id`. [`HistoryEvent::event_id`] combines the two into a
//! single identity: `{seq}_{type}` for sequenced events, the raw `id`
//! otherwise. History is a set under this identity, which is what makes
//! replayed and duplicated deliveries idempotent.
//!
//! ## Why ULID for Event IDs
//!
//! ULIDs sort chronologically when compared as strings, so journal records
//! keyed by `{timestamp}#{eventId}` order correctly without a separate
//! sequence column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::execution::ParentRef;
use crate::id::{ExecutionId, SignalId, WorkflowName};

/// A single entry in an execution's history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,

    /// The event payload, tagged by type.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl HistoryEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Creates an event with an explicit timestamp.
    #[must_use]
    pub const fn at(timestamp: DateTime<Utc>, payload: EventPayload) -> Self {
        Self { timestamp, payload }
    }

    /// Returns the identity of this event within its execution.
    ///
    /// Sequenced events use `{seq}_{type}`; all others use their ULID `id`.
    #[must_use]
    pub fn event_id(&self) -> String {
        match self.payload.seq() {
            Some(seq) => format!("{seq}_{}", self.payload.event_type()),
            None => self.payload.id().unwrap_or_default().to_string(),
        }
    }
}

/// The category of a history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    /// Execution start, run boundaries, terminal outcomes.
    Lifecycle,
    /// Intents recorded when the workflow issues a command.
    Scheduled,
    /// Completions delivered into the execution from outside.
    Result,
}

/// An event emitted to subscribers via the event router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedEvent {
    /// Unique event identifier (ULID).
    pub id: String,
    /// Event name, matched against subscription filters.
    pub name: String,
    /// Event payload.
    pub payload: Value,
}

impl EmittedEvent {
    /// Creates an emitted event with a fresh ULID id.
    #[must_use]
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Ulid::new().to_string(),
            name: name.into(),
            payload,
        }
    }
}

/// A logical operation against the entity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum EntityOperation {
    /// Read the value at `key`.
    Get {
        /// Entity key.
        key: String,
    },
    /// Write `value` at `key`.
    Set {
        /// Entity key.
        key: String,
        /// Value to store.
        value: Value,
    },
    /// Delete the value at `key`.
    Delete {
        /// Entity key.
        key: String,
    },
}

/// A logical operation against the bucket (blob) store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum BucketOperation {
    /// Read the blob at `key`.
    Get {
        /// Blob key.
        key: String,
    },
    /// Write a blob at `key`.
    Put {
        /// Blob key.
        key: String,
        /// Base64-encoded blob contents.
        data: String,
    },
    /// Delete the blob at `key`.
    Delete {
        /// Blob key.
        key: String,
    },
}

/// A field-match query against the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOperation {
    /// Index to query.
    pub index: String,
    /// Document field to match.
    pub field: String,
    /// Value the field must equal.
    pub value: Value,
}

/// Typed history event payloads.
///
/// Serialized with an internal `type` tag so history blobs remain
/// self-describing newline-delimited JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    // --- Lifecycle ---
    /// The execution was created and its input recorded.
    #[serde(rename_all = "camelCase")]
    WorkflowStarted {
        /// Event id (ULID).
        id: String,
        /// Workflow to run.
        workflow_name: WorkflowName,
        /// Workflow input.
        input: Value,
        /// Absolute deadline after which the execution times out.
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_time: Option<DateTime<Utc>>,
        /// Reference to the spawning execution, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        parent: Option<ParentRef>,
    },

    /// A workflow run (one replay + advancement pass) began.
    #[serde(rename_all = "camelCase")]
    WorkflowRunStarted {
        /// Event id (ULID).
        id: String,
    },

    /// A workflow run finished and its commands were executed.
    #[serde(rename_all = "camelCase")]
    WorkflowRunCompleted {
        /// Event id (ULID).
        id: String,
    },

    /// The execution finished successfully.
    #[serde(rename_all = "camelCase")]
    WorkflowSucceeded {
        /// Event id (ULID).
        id: String,
        /// Workflow output.
        output: Value,
    },

    /// The execution failed.
    #[serde(rename_all = "camelCase")]
    WorkflowFailed {
        /// Event id (ULID).
        id: String,
        /// Stable error identifier.
        error: String,
        /// Human-readable failure description.
        message: String,
    },

    /// The execution exceeded its workflow-level timeout.
    #[serde(rename_all = "camelCase")]
    WorkflowTimedOut {
        /// Event id (ULID).
        id: String,
    },

    // --- Scheduled ---
    /// A task invocation was issued.
    #[serde(rename_all = "camelCase")]
    TaskScheduled {
        /// Command sequence number.
        seq: u64,
        /// Task handler name.
        name: String,
    },

    /// A timer was started.
    #[serde(rename_all = "camelCase")]
    TimerScheduled {
        /// Command sequence number.
        seq: u64,
        /// When the timer fires.
        until_time: DateTime<Utc>,
    },

    /// A child workflow was started.
    #[serde(rename_all = "camelCase")]
    ChildWorkflowScheduled {
        /// Command sequence number.
        seq: u64,
        /// Child workflow name.
        name: WorkflowName,
        /// Child workflow input.
        input: Value,
    },

    /// A signal was sent to another execution.
    #[serde(rename_all = "camelCase")]
    SignalSent {
        /// Command sequence number.
        seq: u64,
        /// Target execution.
        execution_id: ExecutionId,
        /// Signal name.
        signal_id: SignalId,
        /// Signal payload.
        payload: Value,
    },

    /// Events were handed to the event router.
    #[serde(rename_all = "camelCase")]
    EventsEmitted {
        /// Command sequence number.
        seq: u64,
        /// The emitted envelopes.
        events: Vec<EmittedEvent>,
    },

    /// The workflow began waiting for a signal.
    #[serde(rename_all = "camelCase")]
    SignalExpectStarted {
        /// Command sequence number.
        seq: u64,
        /// Signal being awaited.
        signal_id: SignalId,
    },

    /// The workflow began waiting on a condition predicate.
    #[serde(rename_all = "camelCase")]
    ConditionStarted {
        /// Command sequence number.
        seq: u64,
    },

    /// An entity store operation was issued.
    #[serde(rename_all = "camelCase")]
    EntityRequest {
        /// Command sequence number.
        seq: u64,
        /// The requested operation.
        operation: EntityOperation,
    },

    /// A bucket store operation was issued.
    #[serde(rename_all = "camelCase")]
    BucketRequest {
        /// Command sequence number.
        seq: u64,
        /// The requested operation.
        operation: BucketOperation,
    },

    /// A search query was issued.
    #[serde(rename_all = "camelCase")]
    SearchRequest {
        /// Command sequence number.
        seq: u64,
        /// The requested query.
        operation: SearchOperation,
    },

    /// A transaction invocation was issued.
    #[serde(rename_all = "camelCase")]
    TransactionRequest {
        /// Command sequence number.
        seq: u64,
        /// Transaction name.
        name: String,
        /// Transaction input.
        input: Value,
    },

    // --- Result ---
    /// A task completed successfully.
    #[serde(rename_all = "camelCase")]
    TaskSucceeded {
        /// Sequence of the matching `TaskScheduled`.
        seq: u64,
        /// Task result.
        result: Value,
    },

    /// A task failed (handler error or timeout).
    #[serde(rename_all = "camelCase")]
    TaskFailed {
        /// Sequence of the matching `TaskScheduled`.
        seq: u64,
        /// Stable error identifier.
        error: String,
        /// Human-readable failure description.
        message: String,
    },

    /// A task missed its heartbeat window.
    #[serde(rename_all = "camelCase")]
    TaskHeartbeatTimedOut {
        /// Sequence of the matching `TaskScheduled`.
        seq: u64,
    },

    /// A timer fired.
    #[serde(rename_all = "camelCase")]
    TimerCompleted {
        /// Sequence of the matching `TimerScheduled`.
        seq: u64,
    },

    /// A child workflow finished successfully.
    #[serde(rename_all = "camelCase")]
    ChildWorkflowSucceeded {
        /// Sequence of the matching `ChildWorkflowScheduled`.
        seq: u64,
        /// Child output.
        result: Value,
    },

    /// A child workflow failed.
    #[serde(rename_all = "camelCase")]
    ChildWorkflowFailed {
        /// Sequence of the matching `ChildWorkflowScheduled`.
        seq: u64,
        /// Stable error identifier.
        error: String,
        /// Human-readable failure description.
        message: String,
    },

    /// A signal arrived at this execution.
    #[serde(rename_all = "camelCase")]
    SignalReceived {
        /// Event id: caller-supplied de-dup key or a fresh ULID.
        id: String,
        /// Signal name.
        signal_id: SignalId,
        /// Signal payload.
        payload: Value,
    },

    /// An expected signal did not arrive in time.
    #[serde(rename_all = "camelCase")]
    SignalTimedOut {
        /// Sequence of the matching `SignalExpectStarted`.
        seq: u64,
        /// Signal that was awaited.
        signal_id: SignalId,
    },

    /// A condition wait expired; the waiter resolves to `false`.
    #[serde(rename_all = "camelCase")]
    ConditionTimedOut {
        /// Sequence of the matching `ConditionStarted`.
        seq: u64,
    },

    /// An entity operation completed.
    #[serde(rename_all = "camelCase")]
    EntityRequestSucceeded {
        /// Sequence of the matching `EntityRequest`.
        seq: u64,
        /// Operation result (`null` for writes).
        result: Value,
    },

    /// An entity operation failed.
    #[serde(rename_all = "camelCase")]
    EntityRequestFailed {
        /// Sequence of the matching `EntityRequest`.
        seq: u64,
        /// Stable error identifier.
        error: String,
        /// Human-readable failure description.
        message: String,
    },

    /// A bucket operation completed.
    #[serde(rename_all = "camelCase")]
    BucketRequestSucceeded {
        /// Sequence of the matching `BucketRequest`.
        seq: u64,
        /// Operation result (`null` for writes, base64 for reads).
        result: Value,
    },

    /// A bucket operation failed.
    #[serde(rename_all = "camelCase")]
    BucketRequestFailed {
        /// Sequence of the matching `BucketRequest`.
        seq: u64,
        /// Stable error identifier.
        error: String,
        /// Human-readable failure description.
        message: String,
    },

    /// A search query completed.
    #[serde(rename_all = "camelCase")]
    SearchRequestSucceeded {
        /// Sequence of the matching `SearchRequest`.
        seq: u64,
        /// Matching documents.
        result: Value,
    },

    /// A search query failed.
    #[serde(rename_all = "camelCase")]
    SearchRequestFailed {
        /// Sequence of the matching `SearchRequest`.
        seq: u64,
        /// Stable error identifier.
        error: String,
        /// Human-readable failure description.
        message: String,
    },

    /// A transaction committed.
    #[serde(rename_all = "camelCase")]
    TransactionRequestSucceeded {
        /// Sequence of the matching `TransactionRequest`.
        seq: u64,
        /// Transaction output.
        result: Value,
    },

    /// A transaction failed permanently.
    #[serde(rename_all = "camelCase")]
    TransactionRequestFailed {
        /// Sequence of the matching `TransactionRequest`.
        seq: u64,
        /// Stable error identifier.
        error: String,
        /// Human-readable failure description.
        message: String,
    },
}

impl EventPayload {
    /// Returns the command sequence number for sequenced events.
    #[must_use]
    pub const fn seq(&self) -> Option<u64> {
        match self {
            Self::TaskScheduled { seq, .. }
            | Self::TimerScheduled { seq, .. }
            | Self::ChildWorkflowScheduled { seq, .. }
            | Self::SignalSent { seq, .. }
            | Self::EventsEmitted { seq, .. }
            | Self::SignalExpectStarted { seq, .. }
            | Self::ConditionStarted { seq }
            | Self::EntityRequest { seq, .. }
            | Self::BucketRequest { seq, .. }
            | Self::SearchRequest { seq, .. }
            | Self::TransactionRequest { seq, .. }
            | Self::TaskSucceeded { seq, .. }
            | Self::TaskFailed { seq, .. }
            | Self::TaskHeartbeatTimedOut { seq }
            | Self::TimerCompleted { seq }
            | Self::ChildWorkflowSucceeded { seq, .. }
            | Self::ChildWorkflowFailed { seq, .. }
            | Self::SignalTimedOut { seq, .. }
            | Self::ConditionTimedOut { seq }
            | Self::EntityRequestSucceeded { seq, .. }
            | Self::EntityRequestFailed { seq, .. }
            | Self::BucketRequestSucceeded { seq, .. }
            | Self::BucketRequestFailed { seq, .. }
            | Self::SearchRequestSucceeded { seq, .. }
            | Self::SearchRequestFailed { seq, .. }
            | Self::TransactionRequestSucceeded { seq, .. }
            | Self::TransactionRequestFailed { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Returns the ULID id for non-sequenced events.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::WorkflowStarted { id, .. }
            | Self::WorkflowRunStarted { id }
            | Self::WorkflowRunCompleted { id }
            | Self::WorkflowSucceeded { id, .. }
            | Self::WorkflowFailed { id, .. }
            | Self::WorkflowTimedOut { id }
            | Self::SignalReceived { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Returns the event type tag as serialized.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "WorkflowStarted",
            Self::WorkflowRunStarted { .. } => "WorkflowRunStarted",
            Self::WorkflowRunCompleted { .. } => "WorkflowRunCompleted",
            Self::WorkflowSucceeded { .. } => "WorkflowSucceeded",
            Self::WorkflowFailed { .. } => "WorkflowFailed",
            Self::WorkflowTimedOut { .. } => "WorkflowTimedOut",
            Self::TaskScheduled { .. } => "TaskScheduled",
            Self::TimerScheduled { .. } => "TimerScheduled",
            Self::ChildWorkflowScheduled { .. } => "ChildWorkflowScheduled",
            Self::SignalSent { .. } => "SignalSent",
            Self::EventsEmitted { .. } => "EventsEmitted",
            Self::SignalExpectStarted { .. } => "SignalExpectStarted",
            Self::ConditionStarted { .. } => "ConditionStarted",
            Self::EntityRequest { .. } => "EntityRequest",
            Self::BucketRequest { .. } => "BucketRequest",
            Self::SearchRequest { .. } => "SearchRequest",
            Self::TransactionRequest { .. } => "TransactionRequest",
            Self::TaskSucceeded { .. } => "TaskSucceeded",
            Self::TaskFailed { .. } => "TaskFailed",
            Self::TaskHeartbeatTimedOut { .. } => "TaskHeartbeatTimedOut",
            Self::TimerCompleted { .. } => "TimerCompleted",
            Self::ChildWorkflowSucceeded { .. } => "ChildWorkflowSucceeded",
            Self::ChildWorkflowFailed { .. } => "ChildWorkflowFailed",
            Self::SignalReceived { .. } => "SignalReceived",
            Self::SignalTimedOut { .. } => "SignalTimedOut",
            Self::ConditionTimedOut { .. } => "ConditionTimedOut",
            Self::EntityRequestSucceeded { .. } => "EntityRequestSucceeded",
            Self::EntityRequestFailed { .. } => "EntityRequestFailed",
            Self::BucketRequestSucceeded { .. } => "BucketRequestSucceeded",
            Self::BucketRequestFailed { .. } => "BucketRequestFailed",
            Self::SearchRequestSucceeded { .. } => "SearchRequestSucceeded",
            Self::SearchRequestFailed { .. } => "SearchRequestFailed",
            Self::TransactionRequestSucceeded { .. } => "TransactionRequestSucceeded",
            Self::TransactionRequestFailed { .. } => "TransactionRequestFailed",
        }
    }

    /// Returns the category this event belongs to.
    #[must_use]
    pub const fn category(&self) -> EventCategory {
        match self {
            Self::WorkflowStarted { .. }
            | Self::WorkflowRunStarted { .. }
            | Self::WorkflowRunCompleted { .. }
            | Self::WorkflowSucceeded { .. }
            | Self::WorkflowFailed { .. }
            | Self::WorkflowTimedOut { .. } => EventCategory::Lifecycle,
            Self::TaskScheduled { .. }
            | Self::TimerScheduled { .. }
            | Self::ChildWorkflowScheduled { .. }
            | Self::SignalSent { .. }
            | Self::EventsEmitted { .. }
            | Self::SignalExpectStarted { .. }
            | Self::ConditionStarted { .. }
            | Self::EntityRequest { .. }
            | Self::BucketRequest { .. }
            | Self::SearchRequest { .. }
            | Self::TransactionRequest { .. } => EventCategory::Scheduled,
            _ => EventCategory::Result,
        }
    }

    /// Returns true for scheduled (intent) events.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.category() == EventCategory::Scheduled
    }

    /// Returns true for result (completion) events.
    #[must_use]
    pub fn is_result(&self) -> bool {
        self.category() == EventCategory::Result
    }

    /// Creates a fresh lifecycle event id.
    #[must_use]
    pub fn fresh_id() -> String {
        Ulid::new().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequenced_event_id_combines_seq_and_type() {
        let event = HistoryEvent::new(EventPayload::TaskScheduled {
            seq: 3,
            name: "hello".into(),
        });
        assert_eq!(event.event_id(), "3_TaskScheduled");
    }

    #[test]
    fn lifecycle_event_id_uses_ulid() {
        let id = EventPayload::fresh_id();
        let event = HistoryEvent::new(EventPayload::WorkflowRunStarted { id: id.clone() });
        assert_eq!(event.event_id(), id);
    }

    #[test]
    fn categories_partition_the_event_space() {
        let scheduled = EventPayload::TimerScheduled {
            seq: 0,
            until_time: Utc::now(),
        };
        let result = EventPayload::TimerCompleted { seq: 0 };
        let lifecycle = EventPayload::WorkflowTimedOut {
            id: EventPayload::fresh_id(),
        };

        assert_eq!(scheduled.category(), EventCategory::Scheduled);
        assert_eq!(result.category(), EventCategory::Result);
        assert_eq!(lifecycle.category(), EventCategory::Lifecycle);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = HistoryEvent::new(EventPayload::TaskSucceeded {
            seq: 1,
            result: serde_json::json!("hi"),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "TaskSucceeded");
        assert_eq!(json["seq"], 1);

        let back: HistoryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.payload, event.payload);
    }

    #[test]
    fn signal_received_is_a_non_sequenced_result() {
        let payload = EventPayload::SignalReceived {
            id: "sig-1".into(),
            signal_id: SignalId::new("go"),
            payload: Value::Null,
        };
        assert!(payload.is_result());
        assert_eq!(payload.seq(), None);
        assert_eq!(payload.id(), Some("sig-1"));
    }
}
