//! # windlass-core
//!
//! Core abstractions for the windlass durable workflow engine.
//!
//! This crate provides the foundational types used across all windlass
//! components:
//!
//! - **Identifiers**: Strongly-typed names and ids for executions, workflows,
//!   and signals
//! - **History Events**: The event-sourced record of every externally
//!   observable decision an execution makes
//! - **Execution Records**: Metadata for running and completed executions
//! - **Canonical Hashing**: Deterministic input hashing for idempotent starts
//! - **Task Tokens**: Opaque callback handles for asynchronous task results
//!
//! ## Crate Boundary
//!
//! `windlass-core` is the **only** crate allowed to define shared primitives.
//! The engine crate and any store backends interact exclusively through the
//! types defined here.
//!
//! ## Example
//!
//! ```rust
//! use windlass_core::prelude::*;
//!
//! let workflow = WorkflowName::new("order-fulfillment")?;
//! let execution = ExecutionId::new(workflow, ExecutionName::new("order-1234")?);
//! assert_eq!(execution.to_string(), "order-fulfillment/order-1234");
//! # Ok::<(), windlass_core::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod event;
pub mod execution;
pub mod hash;
pub mod id;
pub mod token;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use windlass_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::event::{EventPayload, HistoryEvent};
    pub use crate::execution::{Execution, ExecutionStatus, ParentRef};
    pub use crate::hash::input_hash;
    pub use crate::id::{ExecutionId, ExecutionName, SignalId, WorkflowName};
    pub use crate::token::TaskToken;
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use event::{EventPayload, HistoryEvent};
pub use execution::{Execution, ExecutionStatus, ParentRef};
pub use id::{ExecutionId, ExecutionName, SignalId, WorkflowName};
pub use token::TaskToken;
