//! Task-token encoding and decoding.
//!
//! When a task handler defers its result (the async sentinel), the eventual
//! `SendTaskSuccess` / `SendTaskFailure` call must name the waiting command.
//! The token is an opaque base64url encoding of `(executionId, seq)`; callers
//! treat it as a handle and never inspect its contents.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::ExecutionId;

/// An opaque callback handle for one scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskToken {
    /// Execution the task belongs to.
    pub execution_id: ExecutionId,
    /// Sequence of the task's `TaskScheduled` command.
    pub seq: u64,
}

impl TaskToken {
    /// Creates a token for the task at `seq` within `execution_id`.
    #[must_use]
    pub const fn new(execution_id: ExecutionId, seq: u64) -> Self {
        Self { execution_id, seq }
    }

    /// Encodes the token into its opaque wire form.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Serialization {
            message: format!("task token encoding failed: {e}"),
        })?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decodes a token from its opaque wire form.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidToken` if the input is not a valid token.
    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(raw).map_err(|e| Error::InvalidToken {
            message: format!("not base64url: {e}"),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| Error::InvalidToken {
            message: format!("malformed claims: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let token = TaskToken::new("wf/run-1".parse().unwrap(), 7);
        let raw = token.encode().unwrap();
        let decoded = TaskToken::decode(&raw).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = TaskToken::decode("not a token!").unwrap_err();
        assert!(matches!(err, Error::InvalidToken { .. }));
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        let raw = URL_SAFE_NO_PAD.encode(br#"{"foo":1}"#);
        let err = TaskToken::decode(&raw).unwrap_err();
        assert!(matches!(err, Error::InvalidToken { .. }));
    }
}
