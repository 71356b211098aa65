//! JSON (de)serialization helpers shared by the Postgres checkpointer.
//!
//! Mirrors `checkpointer_sqlite_helpers`, except nullable JSONB columns come
//! back from `sqlx` already parsed as [`Value`] rather than as a raw string,
//! so there is no `deserialize_json`-from-`&str` step here.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::runtimes::checkpointer::CheckpointerError;

/// Serializes `value` to a JSON string for binding into a `::jsonb` column.
pub fn serialize_json<T: Serialize>(
    value: &T,
    field: &'static str,
) -> Result<String, CheckpointerError> {
    serde_json::to_string(value).map_err(|e| CheckpointerError::Other {
        message: format!("failed to serialize {field}: {e}"),
    })
}

/// Converts an already-decoded JSONB [`Value`] into `T`.
pub fn deserialize_json_value<T: DeserializeOwned>(
    value: Value,
    field: &'static str,
) -> Result<T, CheckpointerError> {
    serde_json::from_value(value).map_err(|e| CheckpointerError::Other {
        message: format!("failed to deserialize {field}: {e}"),
    })
}

/// Unwraps a nullable JSONB column, erroring with the column name if absent.
pub fn require_json_field(value: Option<Value>, field: &'static str) -> Result<Value, CheckpointerError> {
    value.ok_or_else(|| CheckpointerError::Other {
        message: format!("missing required column: {field}"),
    })
}
