//! Payload compaction: recursively strip null-valued object members so
//! large upstream responses shrink before they cross the protocol
//! boundary. The input is never mutated.

use serde_json::{Map, Value};

/// Return a copy of `value` with every null-valued object member removed,
/// recursively. Array elements are compacted individually but never
/// dropped, so positional data keeps its shape.
pub fn compress_response(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut compacted = Map::with_capacity(map.len());
            for (key, member) in map {
                if member.is_null() {
                    continue;
                }
                compacted.insert(key.clone(), compress_response(member));
            }
            Value::Object(compacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(compress_response).collect()),
        other => other.clone(),
    }
}
