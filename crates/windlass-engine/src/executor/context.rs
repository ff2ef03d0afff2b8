//! The workflow-facing handle for issuing engine primitives.
//!
//! [`WorkflowContext`] is the only door out of a workflow program. Every
//! method allocates the next `seq` eagerly, performs the replay
//! correspondence check, and returns an [`Eventual`]: a future settled by a
//! matching result event (or immediately, for fire-and-forget sends).
//!
//! Combinators ([`all`], [`any`], [`race`], [`all_settled`]) derive their
//! resolution from child eventuals and allocate no `seq` of their own, which
//! keeps scheduled-event sequence numbers dense.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use windlass_core::event::{BucketOperation, EmittedEvent, EntityOperation, SearchOperation};
use windlass_core::{SignalId, WorkflowName};

use super::{
    ConditionWaiter, SharedState, Slot, SlotKind, SlotState, WorkflowInfo, lock_state,
};
use crate::command::{SignalTarget, TimerSpec, WorkflowCommand};
use crate::error::Failure;

/// Options for task invocation.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Overall task deadline; a `TaskFailed` timeout is scheduled alongside
    /// the dispatch.
    pub timeout: Option<Duration>,
    /// Maximum gap between heartbeats before the task is failed.
    pub heartbeat_timeout: Option<Duration>,
}

/// A pending computation inside a running workflow.
///
/// Resolves to the operation's result value, or fails with the [`Failure`]
/// recorded by the corresponding result event.
pub struct Eventual {
    state: SharedState,
    /// `None` marks an eventual issued illegally inside a condition
    /// predicate; polling it reports the determinism violation.
    seq: Option<u64>,
    done: bool,
}

impl std::fmt::Debug for Eventual {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eventual")
            .field("seq", &self.seq)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Future for Eventual {
    type Output = Result<Value, Failure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        let mut state = lock_state(&this.state);
        let Some(seq) = this.seq else {
            state.system_error = Some(Failure::determinism(
                "engine primitive issued inside a condition predicate",
            ));
            return Poll::Pending;
        };
        match state.slots.get(&seq).map(|slot| slot.state.clone()) {
            Some(SlotState::Resolved(value)) => {
                this.done = true;
                Poll::Ready(Ok(value))
            }
            Some(SlotState::Failed(failure)) => {
                this.done = true;
                Poll::Ready(Err(failure))
            }
            Some(SlotState::Pending) | None => Poll::Pending,
        }
    }
}

/// Handle a workflow program uses to issue engine primitives.
#[derive(Clone)]
pub struct WorkflowContext {
    state: SharedState,
    info: Arc<WorkflowInfo>,
}

impl WorkflowContext {
    pub(crate) fn new(state: SharedState, info: Arc<WorkflowInfo>) -> Self {
        Self { state, info }
    }

    /// Returns the execution's static context.
    #[must_use]
    pub fn info(&self) -> &WorkflowInfo {
        &self.info
    }

    /// Returns the run's logical clock.
    ///
    /// Workflows must use this instead of the wall clock; it is stable
    /// across replays of the same run.
    #[must_use]
    pub fn base_time(&self) -> DateTime<Utc> {
        lock_state(&self.state).base_time
    }

    /// Invokes the task handler registered under `name`.
    #[must_use]
    pub fn task(&self, name: impl Into<String>, input: Value) -> Eventual {
        self.task_with_options(name, input, TaskOptions::default())
    }

    /// Invokes a task with explicit timeout options.
    #[must_use]
    pub fn task_with_options(
        &self,
        name: impl Into<String>,
        input: Value,
        options: TaskOptions,
    ) -> Eventual {
        let name = name.into();
        self.request(SlotKind::Task, SlotState::Pending, |seq| {
            WorkflowCommand::StartTask {
                seq,
                name,
                input,
                timeout: options.timeout,
                heartbeat_timeout: options.heartbeat_timeout,
            }
        })
    }

    /// Sleeps for `duration` relative to the run's base time.
    #[must_use]
    pub fn sleep(&self, duration: Duration) -> Eventual {
        self.request(SlotKind::Timer, SlotState::Pending, |seq| {
            WorkflowCommand::StartTimer {
                seq,
                spec: TimerSpec::After(duration),
            }
        })
    }

    /// Sleeps until an absolute instant.
    #[must_use]
    pub fn sleep_until(&self, until: DateTime<Utc>) -> Eventual {
        self.request(SlotKind::Timer, SlotState::Pending, |seq| {
            WorkflowCommand::StartTimer {
                seq,
                spec: TimerSpec::Until(until),
            }
        })
    }

    /// Starts a child workflow and awaits its terminal result.
    #[must_use]
    pub fn child_workflow(&self, workflow: WorkflowName, input: Value) -> Eventual {
        self.request(SlotKind::Child, SlotState::Pending, |seq| {
            WorkflowCommand::StartChildWorkflow {
                seq,
                name: workflow,
                input,
            }
        })
    }

    /// Sends a signal to another execution. Resolves as soon as the send is
    /// recorded; delivery is asynchronous.
    #[must_use]
    pub fn send_signal(
        &self,
        target: SignalTarget,
        signal_id: SignalId,
        payload: Value,
    ) -> Eventual {
        self.request(
            SlotKind::SendSignal,
            SlotState::Resolved(Value::Null),
            |seq| WorkflowCommand::SendSignal {
                seq,
                target,
                signal_id,
                payload,
            },
        )
    }

    /// Emits events to subscribers. Resolves as soon as the emission is
    /// recorded.
    #[must_use]
    pub fn emit_events(&self, events: Vec<EmittedEvent>) -> Eventual {
        self.request(SlotKind::Emit, SlotState::Resolved(Value::Null), |seq| {
            WorkflowCommand::EmitEvents { seq, events }
        })
    }

    /// Waits for a signal, failing the waiter with a timeout after
    /// `timeout`, when set.
    #[must_use]
    pub fn expect_signal(&self, signal_id: SignalId, timeout: Option<Duration>) -> Eventual {
        let eventual = self.request(SlotKind::ExpectSignal, SlotState::Pending, |seq| {
            WorkflowCommand::ExpectSignal {
                seq,
                signal_id: signal_id.clone(),
                timeout,
            }
        });
        if let Some(seq) = eventual.seq {
            let mut state = lock_state(&self.state);
            state.signal_waiters.entry(signal_id).or_default().push(seq);
        }
        eventual
    }

    /// Registers a standing handler invoked on every delivery of
    /// `signal_id`.
    ///
    /// Handlers run synchronously during event application and may issue
    /// further primitives (sends, tasks); registration itself consumes no
    /// sequence number.
    pub fn on_signal(&self, signal_id: SignalId, handler: impl Fn(Value) + 'static) {
        let mut state = lock_state(&self.state);
        if state.in_predicate {
            state.system_error = Some(Failure::determinism(
                "engine primitive issued inside a condition predicate",
            ));
            return;
        }
        state.signal_handlers.push((signal_id, Box::new(handler)));
    }

    /// Waits until `predicate` returns true, re-evaluating after every
    /// applied event. Resolves to `true` on success or `false` when
    /// `timeout` elapses first.
    ///
    /// Predicates must be pure reads of workflow state; issuing a primitive
    /// inside one is a determinism violation.
    #[must_use]
    pub fn condition(
        &self,
        timeout: Option<Duration>,
        predicate: impl Fn() -> bool + 'static,
    ) -> Eventual {
        let eventual = self.request(SlotKind::Condition, SlotState::Pending, |seq| {
            WorkflowCommand::StartCondition { seq, timeout }
        });
        let Some(seq) = eventual.seq else {
            return eventual;
        };

        // First evaluation happens at request time: an already-true
        // predicate resolves without waiting for an event.
        {
            let mut state = lock_state(&self.state);
            state.in_predicate = true;
        }
        let already_true = predicate();
        let mut state = lock_state(&self.state);
        state.in_predicate = false;
        if already_true {
            state.settle(seq, SlotKind::Condition, SlotState::Resolved(Value::Bool(true)));
        } else {
            state.conditions.push(ConditionWaiter {
                seq,
                predicate: Box::new(predicate),
            });
        }
        drop(state);
        eventual
    }

    /// Invokes the transaction handler registered under `name`.
    #[must_use]
    pub fn transaction(&self, name: impl Into<String>, input: Value) -> Eventual {
        let name = name.into();
        self.request(SlotKind::Transaction, SlotState::Pending, |seq| {
            WorkflowCommand::InvokeTransaction { seq, name, input }
        })
    }

    /// Reads an entity value; resolves to the value or `null`.
    #[must_use]
    pub fn entity_get(&self, key: impl Into<String>) -> Eventual {
        self.entity_op(EntityOperation::Get { key: key.into() })
    }

    /// Writes an entity value.
    #[must_use]
    pub fn entity_set(&self, key: impl Into<String>, value: Value) -> Eventual {
        self.entity_op(EntityOperation::Set {
            key: key.into(),
            value,
        })
    }

    /// Deletes an entity value.
    #[must_use]
    pub fn entity_delete(&self, key: impl Into<String>) -> Eventual {
        self.entity_op(EntityOperation::Delete { key: key.into() })
    }

    fn entity_op(&self, operation: EntityOperation) -> Eventual {
        self.request(SlotKind::Entity, SlotState::Pending, |seq| {
            WorkflowCommand::EntityOp { seq, operation }
        })
    }

    /// Reads a blob; resolves to its base64 contents or `null`.
    #[must_use]
    pub fn bucket_get(&self, key: impl Into<String>) -> Eventual {
        self.bucket_op(BucketOperation::Get { key: key.into() })
    }

    /// Writes a blob from base64 contents.
    #[must_use]
    pub fn bucket_put(&self, key: impl Into<String>, data: impl Into<String>) -> Eventual {
        self.bucket_op(BucketOperation::Put {
            key: key.into(),
            data: data.into(),
        })
    }

    /// Deletes a blob.
    #[must_use]
    pub fn bucket_delete(&self, key: impl Into<String>) -> Eventual {
        self.bucket_op(BucketOperation::Delete { key: key.into() })
    }

    fn bucket_op(&self, operation: BucketOperation) -> Eventual {
        self.request(SlotKind::Bucket, SlotState::Pending, |seq| {
            WorkflowCommand::BucketOp { seq, operation }
        })
    }

    /// Runs a field-match query; resolves to the matching documents.
    #[must_use]
    pub fn search(&self, operation: SearchOperation) -> Eventual {
        self.request(SlotKind::Search, SlotState::Pending, |seq| {
            WorkflowCommand::SearchOp { seq, operation }
        })
    }

    /// Allocates the next `seq`, registers the slot, and checks
    /// correspondence against replayed history.
    fn request(
        &self,
        kind: SlotKind,
        initial: SlotState,
        build: impl FnOnce(u64) -> WorkflowCommand,
    ) -> Eventual {
        let mut state = lock_state(&self.state);
        if state.in_predicate {
            state.system_error = Some(Failure::determinism(
                "engine primitive issued inside a condition predicate",
            ));
            return Eventual {
                state: Arc::clone(&self.state),
                seq: None,
                done: false,
            };
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.slots.insert(
            seq,
            Slot {
                kind,
                state: initial,
            },
        );

        let command = build(seq);
        if let Some(expected) = state.expected.pop_front() {
            if !command.corresponds(&expected) {
                state.system_error = Some(Failure::determinism(format!(
                    "history recorded {} at seq {}, but the program issued {} at seq {seq}",
                    expected.event_type(),
                    expected.seq().unwrap_or_default(),
                    command.kind(),
                )));
            }
        } else {
            state.commands.push(command);
        }

        Eventual {
            state: Arc::clone(&self.state),
            seq: Some(seq),
            done: false,
        }
    }
}

/// How one eventual settled inside [`all_settled`].
#[derive(Debug, Clone, PartialEq)]
pub enum SettledResult {
    /// The eventual resolved with a value.
    Resolved(Value),
    /// The eventual failed.
    Failed(Failure),
}

/// Resolves when every child resolves, in input order; fails fast on the
/// first child failure.
#[must_use]
pub fn all(children: Vec<Eventual>) -> All {
    let len = children.len();
    All {
        children,
        results: vec![None; len],
    }
}

/// Future returned by [`all`].
pub struct All {
    children: Vec<Eventual>,
    results: Vec<Option<Value>>,
}

impl Future for All {
    type Output = Result<Vec<Value>, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (index, child) in this.children.iter_mut().enumerate() {
            if this.results[index].is_some() {
                continue;
            }
            match Pin::new(child).poll(cx) {
                Poll::Ready(Ok(value)) => this.results[index] = Some(value),
                Poll::Ready(Err(failure)) => return Poll::Ready(Err(failure)),
                Poll::Pending => {}
            }
        }
        if this.results.iter().all(Option::is_some) {
            let values = this.results.iter_mut().map(|slot| {
                slot.take().unwrap_or(Value::Null)
            });
            Poll::Ready(Ok(values.collect()))
        } else {
            Poll::Pending
        }
    }
}

/// Resolves with every child's settlement, in input order.
#[must_use]
pub fn all_settled(children: Vec<Eventual>) -> AllSettled {
    let len = children.len();
    AllSettled {
        children,
        results: vec![None; len],
    }
}

/// Future returned by [`all_settled`].
pub struct AllSettled {
    children: Vec<Eventual>,
    results: Vec<Option<SettledResult>>,
}

impl Future for AllSettled {
    type Output = Vec<SettledResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (index, child) in this.children.iter_mut().enumerate() {
            if this.results[index].is_some() {
                continue;
            }
            match Pin::new(child).poll(cx) {
                Poll::Ready(Ok(value)) => {
                    this.results[index] = Some(SettledResult::Resolved(value));
                }
                Poll::Ready(Err(failure)) => {
                    this.results[index] = Some(SettledResult::Failed(failure));
                }
                Poll::Pending => {}
            }
        }
        if this.results.iter().all(Option::is_some) {
            let settled = this.results.iter_mut().map(|slot| {
                slot.take()
                    .unwrap_or(SettledResult::Resolved(Value::Null))
            });
            Poll::Ready(settled.collect())
        } else {
            Poll::Pending
        }
    }
}

/// Resolves with the first child that resolves; fails only when every child
/// has failed.
#[must_use]
pub fn any(children: Vec<Eventual>) -> Any {
    let len = children.len();
    Any {
        children,
        failed: vec![false; len],
    }
}

/// Future returned by [`any`].
pub struct Any {
    children: Vec<Eventual>,
    failed: Vec<bool>,
}

impl Future for Any {
    type Output = Result<Value, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (index, child) in this.children.iter_mut().enumerate() {
            if this.failed[index] {
                continue;
            }
            match Pin::new(child).poll(cx) {
                Poll::Ready(Ok(value)) => return Poll::Ready(Ok(value)),
                Poll::Ready(Err(_)) => this.failed[index] = true,
                Poll::Pending => {}
            }
        }
        if this.failed.iter().all(|failed| *failed) {
            Poll::Ready(Err(Failure::new(
                "AggregateError",
                "every eventual failed",
            )))
        } else {
            Poll::Pending
        }
    }
}

/// Resolves or fails with the first child to settle either way.
#[must_use]
pub fn race(children: Vec<Eventual>) -> Race {
    Race { children }
}

/// Future returned by [`race`].
pub struct Race {
    children: Vec<Eventual>,
}

impl Future for Race {
    type Output = Result<Value, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for child in &mut this.children {
            match Pin::new(child).poll(cx) {
                Poll::Ready(settled) => return Poll::Ready(settled),
                Poll::Pending => {}
            }
        }
        Poll::Pending
    }
}
