//! Removal of reserved keys from untrusted JSON before validation.

use serde_json::{Map, Value};

/// Keys that are never accepted from clients, at any depth.
pub const RESERVED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Recursively strip reserved keys from objects, including objects nested in arrays.
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_map(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        other => other,
    }
}

pub fn sanitize_map(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .filter(|(k, _)| {
            let keep = !is_reserved_key(k);
            if !keep {
                tracing::debug!(key = %k, "Stripped reserved key from payload");
            }
            keep
        })
        .map(|(k, v)| (k, sanitize_value(v)))
        .collect()
}
