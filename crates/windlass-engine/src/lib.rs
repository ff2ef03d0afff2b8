//! # windlass-engine
//!
//! Durable workflow orchestration: long-lived, resumable business processes
//! expressed as ordinary imperative code, surviving process restarts and
//! arbitrary latency by event-sourcing every externally observable decision.
//!
//! This crate implements the workflow runtime:
//!
//! - **Workflow Executor**: deterministic history replay plus advancement of
//!   one execution
//! - **Orchestrator**: drains workflow-task batches, runs the executor,
//!   persists results
//! - **Command Executor**: turns workflow intents into side effects and
//!   scheduled events
//! - **Task Worker**: claims dispatched tasks and runs user handlers with
//!   heartbeats and timeouts
//! - **Timer Service**: delivers delayed events through a two-tier schedule
//! - **Routers**: point-to-point signals and fan-out event subscriptions
//! - **Transaction Executor**: optimistic multi-entity transactions
//!
//! Data-plane stores (history log, execution index, timer schedules, entity
//! and bucket stores, event journal) are traits with in-memory
//! implementations for testing.
//!
//! ## Guarantees
//!
//! - **Replay determinism**: the same history always reproduces the same
//!   commands and result
//! - **At-least-once effects**: side effects may repeat; durable results are
//!   recorded at most once per command sequence
//! - **FIFO per execution**: one in-flight workflow task per execution, in
//!   submission order
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use windlass_core::WorkflowName;
//! use windlass_engine::registry::Registry;
//! use windlass_engine::worker::TaskOutput;
//!
//! let mut registry = Registry::new();
//! registry.register_task("hello", |input, _ctx| {
//!     Box::pin(async move {
//!         let name = input["name"].as_str().unwrap_or("world").to_string();
//!         Ok(TaskOutput::Complete(json!(format!("hi {name}"))))
//!     })
//! });
//! registry.register_workflow(WorkflowName::new("greeter")?, |input, ctx| {
//!     Box::pin(async move { ctx.task("hello", input).await })
//! });
//! # Ok::<(), windlass_core::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod command;
pub mod command_executor;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod router;
pub mod service;
pub mod store;
pub mod timer;
pub mod transaction;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::command::{SignalTarget, TimerSpec, WorkflowCommand};
    pub use crate::command_executor::CommandExecutor;
    pub use crate::config::EngineConfig;
    pub use crate::dispatch::{TaskEnvelope, TaskQueue, TransactionEnvelope, TransactionQueue};
    pub use crate::error::{Error, Failure, Result, codes};
    pub use crate::executor::{
        Eventual, RunOutcome, RunResult, TaskOptions, WorkflowContext, WorkflowExecutor,
        WorkflowInfo, all, all_settled, any, race,
    };
    pub use crate::orchestrator::{Orchestrator, OrchestratorOutcome};
    pub use crate::queue::{ExecutionQueue, SubmitResult, WorkflowTask};
    pub use crate::registry::{Registry, Subscription};
    pub use crate::router::{DeadLetterSink, EventRouter, SignalRouter};
    pub use crate::service::{
        EngineClient, EngineService, StartExecutionRequest, StartExecutionResponse,
    };
    pub use crate::store::{
        BucketStore, EntityStore, ExecutionStore, HistoryStore, JournalStore, SearchStore,
        TimerStore,
    };
    pub use crate::timer::{TimerRequest, TimerService};
    pub use crate::transaction::{TransactionExecutor, TransactionOutcome};
    pub use crate::worker::{TaskContext, TaskOutput, TaskWorker};
}
