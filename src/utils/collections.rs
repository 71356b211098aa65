//! Small helpers for working with the `extra` channel's `FxHashMap<String, Value>` maps.

use rustc_hash::FxHashMap;
use serde_json::{Number, Value};

/// Creates an empty extra map.
#[must_use]
pub fn new_extra_map() -> FxHashMap<String, Value> {
    FxHashMap::default()
}

/// Builds an extra map from `(key, value)` pairs.
pub fn extra_map_from_pairs<'a>(
    pairs: impl IntoIterator<Item = (&'a str, Value)>,
) -> FxHashMap<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Merges any number of extra maps left-to-right; later maps win on key conflicts.
pub fn merge_extra_maps<'a>(
    maps: impl IntoIterator<Item = &'a FxHashMap<String, Value>>,
) -> FxHashMap<String, Value> {
    let mut out = FxHashMap::default();
    for map in maps {
        for (k, v) in map {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

/// Typed convenience accessors/mutators for extra maps.
///
/// Kept as an extension trait rather than free functions so call sites read
/// as `map.insert_string(...)` next to the plain `HashMap` API they already use.
pub trait ExtraMapExt {
    fn insert_string(&mut self, key: &str, value: impl Into<String>) -> &mut Self;
    fn insert_number(&mut self, key: &str, value: impl Into<Number>) -> &mut Self;
    fn insert_bool(&mut self, key: &str, value: bool) -> &mut Self;
    fn get_string(&self, key: &str) -> Option<&str>;
    fn get_number(&self, key: &str) -> Option<Number>;
    fn get_bool(&self, key: &str) -> Option<bool>;
}

impl ExtraMapExt for FxHashMap<String, Value> {
    fn insert_string(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.insert(key.to_string(), Value::String(value.into()));
        self
    }

    fn insert_number(&mut self, key: &str, value: impl Into<Number>) -> &mut Self {
        self.insert(key.to_string(), Value::Number(value.into()));
        self
    }

    fn insert_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.insert(key.to_string(), Value::Bool(value));
        self
    }

    fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn get_number(&self, key: &str) -> Option<Number> {
        match self.get(key) {
            Some(Value::Number(n)) => Some(n.clone()),
            _ => None,
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_prefers_later_maps() {
        let a = extra_map_from_pairs([("x", json!(1))]);
        let b = extra_map_from_pairs([("x", json!(2))]);
        let merged = merge_extra_maps([&a, &b]);
        assert_eq!(merged.get("x"), Some(&json!(2)));
    }
}
