//! Error types for the workflow engine.

use windlass_core::ExecutionId;

/// The result type used throughout windlass-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error identifiers surfaced on failed executions.
///
/// These are matched programmatically by callers, so they never change.
pub mod codes {
    /// Replay mismatch between the program and its history.
    pub const DETERMINISM_ERROR: &str = "DeterminismError";
    /// A workflow, task, signal wait, or execution exceeded its deadline.
    pub const TIMEOUT: &str = "Timeout";
    /// The workflow name was not present in the registry.
    pub const WORKFLOW_NOT_FOUND: &str = "WorkflowNotFound";
    /// The task name was not present in the registry.
    pub const TASK_NOT_FOUND: &str = "TaskNotFound";
    /// The transaction name was not present in the registry.
    pub const TRANSACTION_NOT_FOUND: &str = "TransactionNotFound";
    /// A task stopped heartbeating inside its heartbeat window.
    pub const HEARTBEAT_TIMED_OUT: &str = "HeartbeatTimedOut";
    /// A transaction exhausted its conflict retries.
    pub const TRANSACTION_CONFLICT: &str = "TransactionConflict";
}

/// A user-visible failure: a stable `error` identifier plus a human message.
///
/// Exceptions from workflow, task, and transaction handlers are captured in
/// this form rather than as host error types, so replay never depends on
/// exception identity.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    /// Stable identifier suitable for programmatic match.
    pub error: String,
    /// Human-readable description.
    pub message: String,
}

impl Failure {
    /// Creates a failure from an error identifier and message.
    #[must_use]
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout failure.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(codes::TIMEOUT, message)
    }

    /// Creates a determinism failure.
    #[must_use]
    pub fn determinism(message: impl Into<String>) -> Self {
        Self::new(codes::DETERMINISM_ERROR, message)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

/// Errors that can occur in engine operations.
///
/// These are engine-internal faults; they never reach user workflow code.
/// User-level failures travel as [`Failure`] values inside result events.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Replay mismatch between a program and its history. Fatal for the
    /// affected execution.
    #[error("determinism violation: {message}")]
    Determinism {
        /// Description of the mismatch.
        message: String,
    },

    /// An execution was not found.
    #[error("execution not found: {execution_id}")]
    ExecutionNotFound {
        /// The execution that was looked up.
        execution_id: ExecutionId,
    },

    /// An execution with the same name but different input already exists.
    #[error("execution already exists with different input: {execution_id}")]
    ExecutionConflict {
        /// The conflicting execution.
        execution_id: ExecutionId,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A queue operation failed.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the queue failure.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid engine configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from windlass-core.
    #[error("core error: {0}")]
    Core(#[from] windlass_core::Error),
}

impl Error {
    /// Creates a new determinism error.
    #[must_use]
    pub fn determinism(message: impl Into<String>) -> Self {
        Self::Determinism {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new queue error.
    #[must_use]
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determinism_error_display() {
        let err = Error::determinism("expected TaskScheduled at seq 0, got TimerScheduled");
        assert!(err.to_string().contains("determinism violation"));
    }

    #[test]
    fn failure_display_combines_code_and_message() {
        let failure = Failure::timeout("task did not complete within 30s");
        assert_eq!(failure.error, codes::TIMEOUT);
        assert!(failure.to_string().starts_with("Timeout:"));
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "blob missing");
        let err = Error::storage_with_source("failed to read history", source);
        assert!(std::error::Error::source(&err).is_some());
    }
}
