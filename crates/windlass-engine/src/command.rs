//! Workflow commands: intents produced by the workflow executor.
//!
//! A command is the internal, non-persisted form of a workflow's request for
//! a side effect. The command executor turns each command into its side
//! effect plus the corresponding scheduled history event. On replay, a
//! re-issued command is checked for **correspondence** against the scheduled
//! event recorded at the same `seq`; any mismatch is a determinism violation.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use windlass_core::event::{
    BucketOperation, EmittedEvent, EntityOperation, EventPayload, SearchOperation,
};
use windlass_core::{ExecutionId, SignalId, WorkflowName};

/// When a timer should fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerSpec {
    /// Fire at an absolute instant.
    Until(DateTime<Utc>),
    /// Fire after a duration relative to the run's base time.
    After(Duration),
}

impl TimerSpec {
    /// Resolves the absolute due time relative to `base_time`.
    #[must_use]
    pub fn due_time(&self, base_time: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Until(at) => *at,
            Self::After(duration) => base_time + *duration,
        }
    }
}

/// The target of a `SendSignal` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalTarget {
    /// An explicit execution id.
    Execution(ExecutionId),
    /// The child spawned by this execution at `seq`.
    Child {
        /// Workflow the child runs.
        workflow: WorkflowName,
        /// Sequence of the `StartChildWorkflow` command.
        seq: u64,
    },
}

impl SignalTarget {
    /// Resolves the target to a concrete execution id.
    ///
    /// `sender` is the execution issuing the signal; child targets are named
    /// deterministically from the sender's id and the child's `seq`.
    #[must_use]
    pub fn resolve(&self, sender: &ExecutionId) -> ExecutionId {
        match self {
            Self::Execution(id) => id.clone(),
            Self::Child { workflow, seq } => sender.child(workflow.clone(), *seq),
        }
    }
}

/// An intent issued by a running workflow.
///
/// Each command carries the `seq` assigned when the workflow requested it.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowCommand {
    /// Invoke a task handler.
    StartTask {
        /// Command sequence number.
        seq: u64,
        /// Task handler name.
        name: String,
        /// Task input.
        input: Value,
        /// Overall task deadline, relative to dispatch.
        timeout: Option<Duration>,
        /// Maximum gap between heartbeats before the task fails.
        heartbeat_timeout: Option<Duration>,
    },

    /// Start a timer.
    StartTimer {
        /// Command sequence number.
        seq: u64,
        /// When the timer fires.
        spec: TimerSpec,
    },

    /// Start a child workflow.
    StartChildWorkflow {
        /// Command sequence number.
        seq: u64,
        /// Child workflow name.
        name: WorkflowName,
        /// Child workflow input.
        input: Value,
    },

    /// Send a signal to another execution.
    SendSignal {
        /// Command sequence number.
        seq: u64,
        /// Target execution.
        target: SignalTarget,
        /// Signal name.
        signal_id: SignalId,
        /// Signal payload.
        payload: Value,
    },

    /// Emit events to subscribers.
    EmitEvents {
        /// Command sequence number.
        seq: u64,
        /// The envelopes to emit.
        events: Vec<EmittedEvent>,
    },

    /// Wait for a signal to arrive.
    ExpectSignal {
        /// Command sequence number.
        seq: u64,
        /// Signal to wait for.
        signal_id: SignalId,
        /// How long to wait before failing the waiter.
        timeout: Option<Duration>,
    },

    /// Wait for a condition predicate to become true.
    StartCondition {
        /// Command sequence number.
        seq: u64,
        /// How long to wait before resolving the waiter to `false`.
        timeout: Option<Duration>,
    },

    /// Invoke a transaction handler.
    InvokeTransaction {
        /// Command sequence number.
        seq: u64,
        /// Transaction name.
        name: String,
        /// Transaction input.
        input: Value,
    },

    /// Perform an entity store operation.
    EntityOp {
        /// Command sequence number.
        seq: u64,
        /// The operation to perform.
        operation: EntityOperation,
    },

    /// Perform a bucket store operation.
    BucketOp {
        /// Command sequence number.
        seq: u64,
        /// The operation to perform.
        operation: BucketOperation,
    },

    /// Perform a search query.
    SearchOp {
        /// Command sequence number.
        seq: u64,
        /// The query to perform.
        operation: SearchOperation,
    },
}

impl WorkflowCommand {
    /// Returns the sequence number assigned to this command.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        match self {
            Self::StartTask { seq, .. }
            | Self::StartTimer { seq, .. }
            | Self::StartChildWorkflow { seq, .. }
            | Self::SendSignal { seq, .. }
            | Self::EmitEvents { seq, .. }
            | Self::ExpectSignal { seq, .. }
            | Self::StartCondition { seq, .. }
            | Self::InvokeTransaction { seq, .. }
            | Self::EntityOp { seq, .. }
            | Self::BucketOp { seq, .. }
            | Self::SearchOp { seq, .. } => *seq,
        }
    }

    /// Returns a short name for logging and metrics labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StartTask { .. } => "start_task",
            Self::StartTimer { .. } => "start_timer",
            Self::StartChildWorkflow { .. } => "start_child_workflow",
            Self::SendSignal { .. } => "send_signal",
            Self::EmitEvents { .. } => "emit_events",
            Self::ExpectSignal { .. } => "expect_signal",
            Self::StartCondition { .. } => "start_condition",
            Self::InvokeTransaction { .. } => "invoke_transaction",
            Self::EntityOp { .. } => "entity_op",
            Self::BucketOp { .. } => "bucket_op",
            Self::SearchOp { .. } => "search_op",
        }
    }

    /// Checks whether a scheduled history event corresponds to this command.
    ///
    /// Correspondence requires `seq` equality plus a category match on the
    /// identifying fields: task and child-workflow names, signal ids, and
    /// transaction names must all be equal. Payloads are deliberately not
    /// compared; identity is what replay validates.
    #[must_use]
    pub fn corresponds(&self, scheduled: &EventPayload) -> bool {
        match (self, scheduled) {
            (
                Self::StartTask { seq, name, .. },
                EventPayload::TaskScheduled {
                    seq: event_seq,
                    name: event_name,
                },
            ) => seq == event_seq && name == event_name,
            (
                Self::StartTimer { seq, .. },
                EventPayload::TimerScheduled { seq: event_seq, .. },
            ) => seq == event_seq,
            (
                Self::StartChildWorkflow { seq, name, .. },
                EventPayload::ChildWorkflowScheduled {
                    seq: event_seq,
                    name: event_name,
                    ..
                },
            ) => seq == event_seq && name == event_name,
            (
                Self::SendSignal { seq, signal_id, .. },
                EventPayload::SignalSent {
                    seq: event_seq,
                    signal_id: event_signal,
                    ..
                },
            )
            | (
                Self::ExpectSignal { seq, signal_id, .. },
                EventPayload::SignalExpectStarted {
                    seq: event_seq,
                    signal_id: event_signal,
                },
            ) => seq == event_seq && signal_id == event_signal,
            (
                Self::EmitEvents { seq, .. },
                EventPayload::EventsEmitted { seq: event_seq, .. },
            )
            | (
                Self::StartCondition { seq, .. },
                EventPayload::ConditionStarted { seq: event_seq },
            )
            | (
                Self::EntityOp { seq, .. },
                EventPayload::EntityRequest { seq: event_seq, .. },
            )
            | (
                Self::BucketOp { seq, .. },
                EventPayload::BucketRequest { seq: event_seq, .. },
            )
            | (
                Self::SearchOp { seq, .. },
                EventPayload::SearchRequest { seq: event_seq, .. },
            ) => seq == event_seq,
            (
                Self::InvokeTransaction { seq, name, .. },
                EventPayload::TransactionRequest {
                    seq: event_seq,
                    name: event_name,
                    ..
                },
            ) => seq == event_seq && name == event_name,
            _ => false,
        }
    }
}
