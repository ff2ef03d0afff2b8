//! Handler registries for workflows, tasks, transactions, and subscriptions.
//!
//! User handlers are addressed by string name. Registries are explicit
//! objects passed into the orchestrator, task worker, and routers; nothing in
//! the engine reads ambient globals. Lookup is O(1) and a missing name yields
//! a typed terminal failure at the call site, never a panic.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, LocalBoxFuture};
use serde_json::Value;

use windlass_core::WorkflowName;
use windlass_core::event::EmittedEvent;

use crate::error::Failure;
use crate::executor::WorkflowContext;
use crate::transaction::TransactionContext;
use crate::worker::{TaskContext, TaskOutput};

/// A workflow handler: deterministic, replayable coroutine code.
///
/// The returned future suspends only on engine primitives obtained from the
/// [`WorkflowContext`]; it is polled on a single-threaded cooperative loop
/// and therefore does not need to be `Send`.
pub type WorkflowFn = Arc<
    dyn Fn(Value, WorkflowContext) -> LocalBoxFuture<'static, Result<Value, Failure>>
        + Send
        + Sync,
>;

/// A task handler: a short-running unit of external work.
pub type TaskFn =
    Arc<dyn Fn(Value, TaskContext) -> BoxFuture<'static, Result<TaskOutput, Failure>> + Send + Sync>;

/// A transaction handler: entity reads/writes executed optimistically.
pub type TransactionFn = Arc<
    dyn Fn(Value, TransactionContext) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync,
>;

/// A subscription delivery handler.
pub type SubscriptionFn =
    Arc<dyn Fn(EmittedEvent) -> BoxFuture<'static, Result<(), Failure>> + Send + Sync>;

/// A registered event subscription.
#[derive(Clone)]
pub struct Subscription {
    /// Subscription name, for logging and dead-letter records.
    pub name: String,
    /// Deliver only events with this name; `None` matches every event.
    pub event_name: Option<String>,
    /// Additional predicate applied after the name filter.
    pub predicate: Option<Arc<dyn Fn(&EmittedEvent) -> bool + Send + Sync>>,
    /// Delivery handler.
    pub handler: SubscriptionFn,
}

impl Subscription {
    /// Returns true if `event` passes this subscription's filter set.
    #[must_use]
    pub fn matches(&self, event: &EmittedEvent) -> bool {
        if let Some(name) = &self.event_name {
            if name != &event.name {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(event) {
                return false;
            }
        }
        true
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("event_name", &self.event_name)
            .finish_non_exhaustive()
    }
}

/// Named handler tables for one engine deployment.
#[derive(Default)]
pub struct Registry {
    workflows: HashMap<WorkflowName, WorkflowFn>,
    tasks: HashMap<String, TaskFn>,
    transactions: HashMap<String, TransactionFn>,
    subscriptions: Vec<Subscription>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a workflow handler under `name`.
    pub fn register_workflow<F>(&mut self, name: WorkflowName, handler: F)
    where
        F: Fn(Value, WorkflowContext) -> LocalBoxFuture<'static, Result<Value, Failure>>
            + Send
            + Sync
            + 'static,
    {
        self.workflows.insert(name, Arc::new(handler));
    }

    /// Registers a task handler under `name`.
    pub fn register_task<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value, TaskContext) -> BoxFuture<'static, Result<TaskOutput, Failure>>
            + Send
            + Sync
            + 'static,
    {
        self.tasks.insert(name.into(), Arc::new(handler));
    }

    /// Registers a transaction handler under `name`.
    pub fn register_transaction<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value, TransactionContext) -> BoxFuture<'static, Result<Value, Failure>>
            + Send
            + Sync
            + 'static,
    {
        self.transactions.insert(name.into(), Arc::new(handler));
    }

    /// Registers an event subscription.
    pub fn register_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Looks up a workflow handler.
    #[must_use]
    pub fn workflow(&self, name: &WorkflowName) -> Option<WorkflowFn> {
        self.workflows.get(name).cloned()
    }

    /// Looks up a task handler.
    #[must_use]
    pub fn task(&self, name: &str) -> Option<TaskFn> {
        self.tasks.get(name).cloned()
    }

    /// Looks up a transaction handler.
    #[must_use]
    pub fn transaction(&self, name: &str) -> Option<TransactionFn> {
        self.transactions.get(name).cloned()
    }

    /// Returns all registered subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("transactions", &self.transactions.keys().collect::<Vec<_>>())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}
