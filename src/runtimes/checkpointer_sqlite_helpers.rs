//! JSON (de)serialization helpers shared by the SQL-backed checkpointers.
//!
//! Centralizes the "serde error -> `CheckpointerError`" translation so the
//! query bodies in `checkpointer_sqlite.rs` read as plain data flow.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::runtimes::checkpointer::CheckpointerError;

/// Serializes `value` to a JSON string, tagging errors with which logical
/// field failed to serialize.
pub fn serialize_json<T: Serialize>(
    value: &T,
    field: &'static str,
) -> Result<String, CheckpointerError> {
    serde_json::to_string(value).map_err(|e| CheckpointerError::Other {
        message: format!("failed to serialize {field}: {e}"),
    })
}

/// Parses a JSON string into `T`.
pub fn deserialize_json<T: DeserializeOwned>(
    payload: &str,
    field: &'static str,
) -> Result<T, CheckpointerError> {
    serde_json::from_str(payload).map_err(|e| CheckpointerError::Other {
        message: format!("failed to deserialize {field}: {e}"),
    })
}

/// Converts an already-parsed [`Value`] into `T`.
pub fn deserialize_json_value<T: DeserializeOwned>(
    value: Value,
    field: &'static str,
) -> Result<T, CheckpointerError> {
    serde_json::from_value(value).map_err(|e| CheckpointerError::Other {
        message: format!("failed to deserialize {field}: {e}"),
    })
}

/// Unwraps a nullable JSON column, erroring with the column name if absent.
pub fn require_json_field(
    value: Option<String>,
    field: &'static str,
) -> Result<String, CheckpointerError> {
    value.ok_or_else(|| CheckpointerError::Other {
        message: format!("missing required column: {field}"),
    })
}
