//! Indexable text extraction.
//!
//! Walks a record depth-first in field order and collects the string values
//! of whitelisted keys, wherever they are nested:
//!
//! ```text
//! {name: "Ann", from: {name: "Bob"}, comments: {data: [{message: "Hi"}]}}
//!   with keys [name, message]  →  ["Ann", "Bob", "Hi"]
//! ```
//!
//! Objects and arrays are descended into; scalar values are never split or
//! searched. Each string appears once, at its first position. The walk
//! relies on `serde_json`'s `preserve_order`, so the same record always
//! yields the same sequence.

use serde_json::Value;

/// Collect unique string values of `keys` from `value`, in walk order.
pub fn extract_texts(value: &Value, keys: &[String]) -> Vec<String> {
    let mut texts = Vec::new();
    walk(value, keys, &mut texts);
    texts
}

/// Extracted texts joined into the blob handed to the search index.
pub fn indexable_text(value: &Value, keys: &[String]) -> String {
    extract_texts(value, keys).join(" ")
}

fn walk(value: &Value, keys: &[String], texts: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, field) in map {
                match field {
                    Value::Object(_) | Value::Array(_) => walk(field, keys, texts),
                    Value::String(s) => {
                        if keys.iter().any(|k| k == key) && !texts.contains(s) {
                            texts.push(s.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, keys, texts);
            }
        }
        _ => {}
    }
}
