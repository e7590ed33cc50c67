//! Query keys, hashing and key matching.
//!
//! A [`QueryKey`] is any JSON value; plain strings are normalised into a
//! one-element array so `"todos"` and `["todos"]` identify the same query.
//! Hashing serialises the key with object members in sorted order, so two
//! keys that are structurally equal always produce the same hash.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logical identity of a cached query or mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Value);

/// Custom key hashing function (`query_key_hash_fn`).
pub type QueryKeyHashFn = Arc<dyn Fn(&QueryKey) -> String + Send + Sync>;

impl QueryKey {
    /// Build a key from any JSON value.
    ///
    /// Non-array values are wrapped in a one-element array.
    pub fn new(value: impl Into<Value>) -> Self {
        match value.into() {
            Value::Array(items) => QueryKey(Value::Array(items)),
            other => QueryKey(Value::Array(vec![other])),
        }
    }

    /// The underlying JSON value (always an array).
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Number of segments in the key.
    pub fn len(&self) -> usize {
        self.0.as_array().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Default deterministic hash of this key.
    pub fn hash_key(&self) -> String {
        hash_query_key(self)
    }

    /// Whether `self` starts with (or partially matches) `prefix`.
    ///
    /// Arrays match element-wise as prefixes, objects match when every
    /// member of `prefix` matches the same member in `self`.
    pub fn matches_prefix(&self, prefix: &QueryKey) -> bool {
        partial_match(&self.0, &prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hash_query_key(self))
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        QueryKey::new(value)
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        QueryKey::new(value)
    }
}

impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        QueryKey::new(value)
    }
}

/// Hash a key into its cache identity.
///
/// Object members are sorted before serialising, so the result does not
/// depend on insertion order even when `serde_json/preserve_order` is on.
pub fn hash_query_key(key: &QueryKey) -> String {
    stable(&key.0).to_string()
}

fn stable(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(stable).collect()),
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), stable(v)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

fn partial_match(value: &Value, pattern: &Value) -> bool {
    match (value, pattern) {
        (Value::Array(items), Value::Array(prefix)) => {
            prefix.len() <= items.len()
                && prefix
                    .iter()
                    .zip(items.iter())
                    .all(|(p, item)| partial_match(item, p))
        }
        (Value::Object(map), Value::Object(pattern)) => pattern
            .iter()
            .all(|(k, p)| map.get(k).is_some_and(|v| partial_match(v, p))),
        (a, b) => a == b,
    }
}

/// Hash a key with an optional custom hash function.
pub(crate) fn hash_with(key: &QueryKey, hash_fn: Option<&QueryKeyHashFn>) -> String {
    match hash_fn {
        Some(f) => f(key),
        None => hash_query_key(key),
    }
}
