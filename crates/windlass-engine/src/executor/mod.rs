//! Deterministic replay and advancement of one execution.
//!
//! The executor accepts a workflow program plus an ordered history and drives
//! the program to its next suspension point. Engine primitives are the only
//! non-deterministic operations a workflow may perform; each one is assigned
//! a dense, monotonic `seq` at request time, so "the k-th primitive issued"
//! is a stable identity across replays.
//!
//! ## Replay Contract
//!
//! 1. History is partitioned into `expected` (scheduled events) and `events`
//!    (result and preempting lifecycle events), both in append order.
//! 2. Every primitive request allocates the next `seq` and is checked for
//!    correspondence against the next `expected` entry; with no entry left,
//!    the request becomes a new command for this run.
//! 3. Result events are drained in order, resolving the waiting eventuals;
//!    the program is advanced to its next suspension point after each event,
//!    and condition predicates are re-evaluated between events.
//! 4. Any correspondence mismatch, result for an unknown `seq`, or primitive
//!    issued inside a condition predicate is a determinism violation, fatal
//!    for the execution.
//!
//! The program itself is an ordinary `async` block polled on a
//! single-threaded cooperative loop with a noop waker; wakeups are driven by
//! slot resolution, not by the host runtime.

pub mod context;

pub use context::{
    Eventual, SettledResult, TaskOptions, WorkflowContext, all, all_settled, any, race,
};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Poll;

use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;
use futures::task::noop_waker;
use serde_json::Value;

use windlass_core::event::{EventCategory, EventPayload};
use windlass_core::{ExecutionId, HistoryEvent, SignalId, WorkflowName};
use windlass_core::execution::ParentRef;

use crate::command::WorkflowCommand;
use crate::error::{Failure, codes};
use crate::registry::WorkflowFn;

/// Static context describing the execution a workflow run belongs to.
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    /// Workflow being run.
    pub workflow_name: WorkflowName,
    /// The execution's id.
    pub execution_id: ExecutionId,
    /// When the execution started.
    pub start_time: DateTime<Utc>,
    /// Reference to the spawning execution, if this is a child.
    pub parent: Option<ParentRef>,
}

/// The outcome of one workflow run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    /// The program is suspended awaiting external results.
    Pending,
    /// The program returned an output.
    Succeeded(Value),
    /// The program failed (user failure or determinism violation).
    Failed(Failure),
    /// A workflow-level timeout preempted the run.
    TimedOut,
}

impl RunResult {
    /// Returns true for `Succeeded`, `Failed`, and `TimedOut`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// The result of running the executor over one batch of history.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Terminal result or `Pending`.
    pub result: RunResult,
    /// New commands issued by this run, in `seq` order.
    pub commands: Vec<WorkflowCommand>,
}

/// What kind of result event settles a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotKind {
    Task,
    Timer,
    Child,
    SendSignal,
    Emit,
    ExpectSignal,
    Condition,
    Entity,
    Bucket,
    Search,
    Transaction,
}

impl SlotKind {
    const fn describe(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Timer => "timer",
            Self::Child => "child workflow",
            Self::SendSignal => "signal send",
            Self::Emit => "event emission",
            Self::ExpectSignal => "signal wait",
            Self::Condition => "condition",
            Self::Entity => "entity operation",
            Self::Bucket => "bucket operation",
            Self::Search => "search operation",
            Self::Transaction => "transaction",
        }
    }
}

/// Settlement state of one pending computation.
#[derive(Debug, Clone)]
pub(crate) enum SlotState {
    Pending,
    Resolved(Value),
    Failed(Failure),
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) kind: SlotKind,
    pub(crate) state: SlotState,
}

pub(crate) struct ConditionWaiter {
    pub(crate) seq: u64,
    pub(crate) predicate: Box<dyn Fn() -> bool>,
}

type SignalHandlerFn = Box<dyn Fn(Value)>;

/// Mutable executor state shared between the run loop and the context handle.
pub(crate) struct ExecutorState {
    pub(crate) base_time: DateTime<Utc>,
    pub(crate) next_seq: u64,
    pub(crate) expected: VecDeque<EventPayload>,
    pub(crate) commands: Vec<WorkflowCommand>,
    pub(crate) slots: HashMap<u64, Slot>,
    pub(crate) signal_waiters: HashMap<SignalId, Vec<u64>>,
    pub(crate) signal_handlers: Vec<(SignalId, SignalHandlerFn)>,
    pub(crate) conditions: Vec<ConditionWaiter>,
    pub(crate) in_predicate: bool,
    pub(crate) system_error: Option<Failure>,
    pub(crate) timed_out: bool,
}

impl ExecutorState {
    fn new(base_time: DateTime<Utc>) -> Self {
        Self {
            base_time,
            next_seq: 0,
            expected: VecDeque::new(),
            commands: Vec::new(),
            slots: HashMap::new(),
            signal_waiters: HashMap::new(),
            signal_handlers: Vec::new(),
            conditions: Vec::new(),
            in_predicate: false,
            system_error: None,
            timed_out: false,
        }
    }

    /// Settles the slot at `seq`, validating its kind.
    ///
    /// Duplicate settlements are ignored; the event-id set upstream already
    /// deduplicates, and timer delivery is at-least-once by contract.
    fn settle(&mut self, seq: u64, kind: SlotKind, state: SlotState) {
        let Some(slot) = self.slots.get_mut(&seq) else {
            self.system_error = Some(Failure::determinism(format!(
                "result event for unknown seq {seq}"
            )));
            return;
        };
        if slot.kind != kind {
            self.system_error = Some(Failure::determinism(format!(
                "result event for seq {seq} settles a {}, but the workflow issued a {}",
                kind.describe(),
                slot.kind.describe()
            )));
            return;
        }
        if matches!(slot.state, SlotState::Pending) {
            slot.state = state;
        }
    }
}

pub(crate) type SharedState = Arc<Mutex<ExecutorState>>;

pub(crate) fn lock_state(state: &SharedState) -> MutexGuard<'_, ExecutorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deterministic executor for one workflow run.
///
/// A fresh executor is built per run; continuation across runs happens by
/// replaying the full persisted history.
pub struct WorkflowExecutor {
    info: Arc<WorkflowInfo>,
    state: SharedState,
}

impl WorkflowExecutor {
    /// Creates an executor for one run.
    ///
    /// `base_time` is the run's logical clock: relative timers resolve
    /// against it and synthetic timer completions are stamped with it.
    #[must_use]
    pub fn new(info: WorkflowInfo, base_time: DateTime<Utc>) -> Self {
        Self {
            info: Arc::new(info),
            state: Arc::new(Mutex::new(ExecutorState::new(base_time))),
        }
    }

    /// Runs the program against `history` and returns the outcome.
    ///
    /// `history` is the dedup-merged union of persisted history and the
    /// current workflow task's events, in order.
    pub fn run(self, handler: &WorkflowFn, input: Value, history: &[HistoryEvent]) -> RunOutcome {
        let base_time = lock_state(&self.state).base_time;
        let (expected, events) = partition_history(history, base_time);
        lock_state(&self.state).expected = expected;

        let ctx = WorkflowContext::new(Arc::clone(&self.state), Arc::clone(&self.info));
        let mut program = handler(input, ctx);
        let mut done: Option<Result<Value, Failure>> = None;

        poll_program(&mut program, &mut done);
        if eval_conditions(&self.state) {
            poll_program(&mut program, &mut done);
        }

        for event in &events {
            {
                let state = lock_state(&self.state);
                if state.system_error.is_some() || state.timed_out {
                    break;
                }
            }
            if done.is_some() {
                break;
            }

            apply_event(&self.state, event);
            if lock_state(&self.state).timed_out {
                break;
            }

            poll_program(&mut program, &mut done);
            if eval_conditions(&self.state) {
                poll_program(&mut program, &mut done);
            }
        }

        drop(program);
        self.finalize(done)
    }

    fn finalize(self, done: Option<Result<Value, Failure>>) -> RunOutcome {
        let mut state = lock_state(&self.state);
        let mut commands = std::mem::take(&mut state.commands);

        let result = if state.timed_out {
            RunResult::TimedOut
        } else if let Some(failure) = state.system_error.take() {
            RunResult::Failed(failure)
        } else {
            match done {
                Some(Ok(output)) if state.expected.is_empty() => RunResult::Succeeded(output),
                None if state.expected.is_empty() => RunResult::Pending,
                Some(Err(failure)) => RunResult::Failed(failure),
                Some(Ok(_)) | None => RunResult::Failed(Failure::determinism(format!(
                    "history contains {} scheduled event(s) the program never issued",
                    state.expected.len()
                ))),
            }
        };

        // A determinism fault invalidates the run's intents: execute nothing.
        if let RunResult::Failed(failure) = &result {
            if failure.error == codes::DETERMINISM_ERROR {
                commands.clear();
            }
        }

        RunOutcome { result, commands }
    }
}

/// Splits history into the expected (scheduled) queue and the result-event
/// stream, deduplicating by event id and synthesizing completions for timers
/// that are already due at `base_time`.
fn partition_history(
    history: &[HistoryEvent],
    base_time: DateTime<Utc>,
) -> (VecDeque<EventPayload>, Vec<HistoryEvent>) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut expected = VecDeque::new();
    let mut events = Vec::new();
    let mut scheduled_timers: Vec<(u64, DateTime<Utc>)> = Vec::new();
    let mut completed_timers: HashSet<u64> = HashSet::new();

    for event in history {
        if !seen.insert(event.event_id()) {
            continue;
        }
        match event.payload.category() {
            EventCategory::Scheduled => {
                if let EventPayload::TimerScheduled { seq, until_time } = &event.payload {
                    scheduled_timers.push((*seq, *until_time));
                }
                expected.push_back(event.payload.clone());
            }
            EventCategory::Result => {
                if let EventPayload::TimerCompleted { seq } = &event.payload {
                    completed_timers.insert(*seq);
                }
                events.push(event.clone());
            }
            EventCategory::Lifecycle => {
                if matches!(event.payload, EventPayload::WorkflowTimedOut { .. }) {
                    events.push(event.clone());
                }
            }
        }
    }

    // A due timer whose completion was never delivered still fires, exactly
    // once, at the run's base time.
    for (seq, until_time) in scheduled_timers {
        if until_time <= base_time && !completed_timers.contains(&seq) {
            let synthetic = HistoryEvent::at(base_time, EventPayload::TimerCompleted { seq });
            if seen.insert(synthetic.event_id()) {
                events.push(synthetic);
            }
        }
    }

    (expected, events)
}

fn poll_program(
    program: &mut LocalBoxFuture<'static, Result<Value, Failure>>,
    done: &mut Option<Result<Value, Failure>>,
) {
    if done.is_some() {
        return;
    }
    let waker = noop_waker();
    let mut cx = std::task::Context::from_waker(&waker);
    if let Poll::Ready(output) = program.as_mut().poll(&mut cx) {
        *done = Some(output);
    }
}

/// Applies one result (or preempting lifecycle) event to the state.
fn apply_event(shared: &SharedState, event: &HistoryEvent) {
    match &event.payload {
        EventPayload::WorkflowTimedOut { .. } => {
            lock_state(shared).timed_out = true;
        }
        EventPayload::TaskSucceeded { seq, result } => {
            lock_state(shared).settle(*seq, SlotKind::Task, SlotState::Resolved(result.clone()));
        }
        EventPayload::TaskFailed {
            seq,
            error,
            message,
        } => {
            lock_state(shared).settle(
                *seq,
                SlotKind::Task,
                SlotState::Failed(Failure::new(error.clone(), message.clone())),
            );
        }
        EventPayload::TaskHeartbeatTimedOut { seq } => {
            lock_state(shared).settle(
                *seq,
                SlotKind::Task,
                SlotState::Failed(Failure::new(
                    codes::HEARTBEAT_TIMED_OUT,
                    "task stopped heartbeating inside its heartbeat window",
                )),
            );
        }
        EventPayload::TimerCompleted { seq } => {
            lock_state(shared).settle(*seq, SlotKind::Timer, SlotState::Resolved(Value::Null));
        }
        EventPayload::ChildWorkflowSucceeded { seq, result } => {
            lock_state(shared).settle(*seq, SlotKind::Child, SlotState::Resolved(result.clone()));
        }
        EventPayload::ChildWorkflowFailed {
            seq,
            error,
            message,
        } => {
            lock_state(shared).settle(
                *seq,
                SlotKind::Child,
                SlotState::Failed(Failure::new(error.clone(), message.clone())),
            );
        }
        EventPayload::SignalReceived {
            signal_id, payload, ..
        } => {
            apply_signal(shared, signal_id, payload);
        }
        EventPayload::SignalTimedOut { seq, signal_id } => {
            let mut state = lock_state(shared);
            if let Some(waiters) = state.signal_waiters.get_mut(signal_id) {
                waiters.retain(|waiter| waiter != seq);
            }
            state.settle(
                *seq,
                SlotKind::ExpectSignal,
                SlotState::Failed(Failure::timeout(format!(
                    "signal '{signal_id}' did not arrive in time"
                ))),
            );
        }
        EventPayload::ConditionTimedOut { seq } => {
            let mut state = lock_state(shared);
            state.conditions.retain(|waiter| waiter.seq != *seq);
            state.settle(
                *seq,
                SlotKind::Condition,
                SlotState::Resolved(Value::Bool(false)),
            );
        }
        EventPayload::EntityRequestSucceeded { seq, result } => {
            lock_state(shared).settle(*seq, SlotKind::Entity, SlotState::Resolved(result.clone()));
        }
        EventPayload::EntityRequestFailed {
            seq,
            error,
            message,
        } => {
            lock_state(shared).settle(
                *seq,
                SlotKind::Entity,
                SlotState::Failed(Failure::new(error.clone(), message.clone())),
            );
        }
        EventPayload::BucketRequestSucceeded { seq, result } => {
            lock_state(shared).settle(*seq, SlotKind::Bucket, SlotState::Resolved(result.clone()));
        }
        EventPayload::BucketRequestFailed {
            seq,
            error,
            message,
        } => {
            lock_state(shared).settle(
                *seq,
                SlotKind::Bucket,
                SlotState::Failed(Failure::new(error.clone(), message.clone())),
            );
        }
        EventPayload::SearchRequestSucceeded { seq, result } => {
            lock_state(shared).settle(*seq, SlotKind::Search, SlotState::Resolved(result.clone()));
        }
        EventPayload::SearchRequestFailed {
            seq,
            error,
            message,
        } => {
            lock_state(shared).settle(
                *seq,
                SlotKind::Search,
                SlotState::Failed(Failure::new(error.clone(), message.clone())),
            );
        }
        EventPayload::TransactionRequestSucceeded { seq, result } => {
            lock_state(shared).settle(
                *seq,
                SlotKind::Transaction,
                SlotState::Resolved(result.clone()),
            );
        }
        EventPayload::TransactionRequestFailed {
            seq,
            error,
            message,
        } => {
            lock_state(shared).settle(
                *seq,
                SlotKind::Transaction,
                SlotState::Failed(Failure::new(error.clone(), message.clone())),
            );
        }
        // Scheduled events never reach the drain loop, and remaining
        // lifecycle events carry no replay semantics.
        _ => {}
    }
}

/// Delivers a signal: resolves every pending expect-signal waiter and then
/// invokes standing handlers (outside the lock, so handlers may issue
/// primitives of their own).
fn apply_signal(shared: &SharedState, signal_id: &SignalId, payload: &Value) {
    let (waiters, handlers) = {
        let mut state = lock_state(shared);
        let waiters = state
            .signal_waiters
            .get_mut(signal_id)
            .map(std::mem::take)
            .unwrap_or_default();
        let handlers = std::mem::take(&mut state.signal_handlers);
        (waiters, handlers)
    };

    {
        let mut state = lock_state(shared);
        for seq in waiters {
            state.settle(
                seq,
                SlotKind::ExpectSignal,
                SlotState::Resolved(payload.clone()),
            );
        }
    }

    for (registered_id, handler) in &handlers {
        if registered_id == signal_id {
            handler(payload.clone());
        }
    }

    // Handlers may have registered more handlers; keep the originals first.
    let mut state = lock_state(shared);
    let added = std::mem::take(&mut state.signal_handlers);
    let mut merged = handlers;
    merged.extend(added);
    state.signal_handlers = merged;
}

/// Evaluates pending condition predicates; returns true if any resolved.
fn eval_conditions(shared: &SharedState) -> bool {
    let mut waiters = {
        let mut state = lock_state(shared);
        if state.conditions.is_empty() {
            return false;
        }
        state.in_predicate = true;
        std::mem::take(&mut state.conditions)
    };

    let mut resolved = Vec::new();
    waiters.retain(|waiter| {
        if (waiter.predicate)() {
            resolved.push(waiter.seq);
            false
        } else {
            true
        }
    });

    let mut state = lock_state(shared);
    state.in_predicate = false;
    state.conditions = waiters;
    let any_resolved = !resolved.is_empty();
    for seq in resolved {
        state.settle(seq, SlotKind::Condition, SlotState::Resolved(Value::Bool(true)));
    }
    any_resolved
}
