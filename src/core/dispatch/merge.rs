// src/core/dispatch/merge.rs

//! Merges the partial responses of a fanned-out request into one.
//!
//! Rules, per field:
//! - lists concatenate, dropping duplicates, first occurrence wins the order;
//! - objects merge recursively;
//! - `totalItems` sums, `error` takes the maximum, other integers last-wins;
//! - strings last-wins, except that a declared priority pair protects the
//!   higher-priority value once present;
//! - finally, a paginated `data.items` is re-sliced to the offset and limit
//!   the caller originally asked for.

use serde_json::{Map, Value};

/// Messages that must survive a merge over their lower-priority sibling.
/// `(winner, loser)`: once the winner is in place, the loser cannot evict it.
const PRIORITY_PAIRS: &[(&str, &str)] = &[(
    "Some agents were not restarted",
    "All selected agents were restarted",
)];

/// Merges `responses` in order and re-slices `data.items` by the original
/// pagination window.
pub fn merge_results(responses: &[Value], offset: usize, limit: Option<usize>) -> Value {
    let mut merged = Map::new();
    for response in responses {
        if let Value::Object(map) = response {
            merge_object(&mut merged, map);
        }
    }

    if let Some(items) = merged
        .get_mut("data")
        .and_then(|d| d.as_object_mut())
        .and_then(|d| d.get_mut("items"))
        && let Value::Array(list) = items
    {
        let end = limit.map_or(list.len(), |l| (offset + l).min(list.len()));
        let start = offset.min(list.len());
        *list = list[start..end.max(start)].to_vec();
    }

    Value::Object(merged)
}

fn merge_object(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, field) in source {
        match field {
            Value::Object(source_map) => {
                let entry = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(target_map) = entry {
                    merge_object(target_map, source_map);
                } else {
                    *entry = field.clone();
                }
            }
            Value::Array(items) => match target.get_mut(key) {
                Some(Value::Array(existing)) => {
                    for item in items {
                        if !existing.contains(item) {
                            existing.push(item.clone());
                        }
                    }
                }
                _ => {
                    target.insert(key.clone(), field.clone());
                }
            },
            Value::Number(n) if n.is_i64() || n.is_u64() => {
                let incoming = n.as_i64().unwrap_or_default();
                match target.get(key).and_then(Value::as_i64) {
                    Some(current) if key == "totalItems" => {
                        target.insert(key.clone(), Value::from(current + incoming));
                    }
                    Some(current) if key == "error" => {
                        target.insert(key.clone(), Value::from(current.max(incoming)));
                    }
                    _ => {
                        target.insert(key.clone(), field.clone());
                    }
                }
            }
            Value::String(incoming) => {
                let protected = target
                    .get(key)
                    .and_then(Value::as_str)
                    .is_some_and(|current| {
                        PRIORITY_PAIRS
                            .iter()
                            .any(|(winner, loser)| current == *winner && incoming == loser)
                    });
                if !protected {
                    target.insert(key.clone(), field.clone());
                }
            }
            _ => {
                target.insert(key.clone(), field.clone());
            }
        }
    }
}
