//! Strongly-typed identifiers for windlass entities.
//!
//! All identifiers in windlass are:
//! - **Strongly typed**: Prevents mixing up different name kinds at compile time
//! - **Human readable**: Execution ids embed the workflow and execution names
//! - **Stable**: The same workflow/execution pair always yields the same id
//!
//! # Example
//!
//! ```rust
//! use windlass_core::id::{ExecutionId, ExecutionName, WorkflowName};
//!
//! let workflow = WorkflowName::new("order-fulfillment")?;
//! let execution = ExecutionId::new(workflow, ExecutionName::new("order-1234")?);
//!
//! assert_eq!(execution.to_string(), "order-fulfillment/order-1234");
//! # Ok::<(), windlass_core::Error>(())
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// The name of a registered workflow.
///
/// Workflow names address workflow handlers in the registry and form the
/// first segment of every [`ExecutionId`], so they must not contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowName(String);

impl WorkflowName {
    /// Creates a workflow name after validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or contains `/`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidId {
                message: "workflow name must not be empty".into(),
            });
        }
        if name.contains('/') {
            return Err(Error::InvalidId {
                message: format!("workflow name '{name}' must not contain '/'"),
            });
        }
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// The name of one execution of a workflow.
///
/// Execution names are unique per workflow. Child executions use names of the
/// form `{parentName}/{seq}`, so `/` is permitted here (unlike
/// [`WorkflowName`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionName(String);

impl ExecutionName {
    /// Creates an execution name after validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidId {
                message: "execution name must not be empty".into(),
            });
        }
        Ok(Self(name))
    }

    /// Generates a fresh execution name from a ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Returns the name of the child execution spawned at `seq`.
    ///
    /// Child naming is deterministic so that a retried `StartChildWorkflow`
    /// command resolves to the same execution.
    #[must_use]
    pub fn child(&self, seq: u64) -> Self {
        Self(format!("{}/{seq}", self.0))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// A unique identifier for one execution: `{workflowName}/{executionName}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId {
    workflow: WorkflowName,
    name: ExecutionName,
}

impl ExecutionId {
    /// Creates an execution id from its parts.
    #[must_use]
    pub const fn new(workflow: WorkflowName, name: ExecutionName) -> Self {
        Self { workflow, name }
    }

    /// Returns the workflow name segment.
    #[must_use]
    pub const fn workflow(&self) -> &WorkflowName {
        &self.workflow
    }

    /// Returns the execution name segment.
    #[must_use]
    pub const fn name(&self) -> &ExecutionName {
        &self.name
    }

    /// Returns the id of the child execution spawned at `seq`.
    ///
    /// The child runs `child_workflow` under the execution name
    /// `{parentExecutionName}/{seq}`.
    #[must_use]
    pub fn child(&self, child_workflow: WorkflowName, seq: u64) -> Self {
        Self {
            workflow: child_workflow,
            name: self.name.child(seq),
        }
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow, self.name)
    }
}

impl FromStr for ExecutionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (workflow, name) = s.split_once('/').ok_or_else(|| Error::InvalidId {
            message: format!("execution id '{s}' must have the form workflow/name"),
        })?;
        Ok(Self {
            workflow: WorkflowName::new(workflow)?,
            name: ExecutionName::new(name)?,
        })
    }
}

impl Serialize for ExecutionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExecutionId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The name of a signal addressed to an execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(String);

impl SignalId {
    /// Creates a signal id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SignalId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
