//! Canonical JSON serialization and input hashing.
//!
//! Idempotent `StartExecution` compares inputs by hash, so the same logical
//! input must always hash to the same bytes. Canonical JSON here is:
//!
//! - Object keys sorted lexicographically (UTF-8 byte order)
//! - No whitespace
//! - UTF-8 output
//!
//! Non-finite numbers are rejected; they have no JSON representation and
//! would otherwise silently serialize as `null`.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Serializes `value` into canonical JSON bytes.
///
/// # Errors
///
/// Returns a serialization error if the value contains a non-finite number.
pub fn canonical_json_bytes(value: &Value) -> Result<Vec<u8>> {
    let canonical = canonicalize(value)?;
    serde_json::to_vec(&canonical).map_err(|e| Error::Serialization {
        message: format!("canonical serialization failed: {e}"),
    })
}

/// Computes the hex-encoded SHA-256 hash of the canonical form of `value`.
///
/// # Errors
///
/// Returns a serialization error if the value cannot be canonicalized.
pub fn input_hash(value: &Value) -> Result<String> {
    let bytes = canonical_json_bytes(value)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex_encode(&digest))
}

fn canonicalize(value: &Value) -> Result<Value> {
    match value {
        Value::Number(n) => {
            if n.as_f64().is_some_and(|f| !f.is_finite()) {
                return Err(Error::Serialization {
                    message: "non-finite number not allowed in canonical JSON".into(),
                });
            }
            Ok(value.clone())
        }
        Value::Array(items) => {
            let canonical = items.iter().map(canonicalize).collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(canonical))
        }
        Value::Object(map) => {
            // serde_json::Map with default features preserves insertion order,
            // so rebuild in sorted key order.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                let entry = map
                    .get(key)
                    .ok_or_else(|| Error::serialization("key vanished during canonicalization"))?;
                sorted.insert(key.clone(), canonicalize(entry)?);
            }
            Ok(Value::Object(sorted))
        }
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(value.clone()),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
