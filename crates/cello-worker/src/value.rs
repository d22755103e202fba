// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Serialization-safe conversion of interpreter values.
//!
//! Stream payloads must be plain data: numbers, strings, booleans, arrays,
//! objects, null.  Interpreter embeddings tag the structures JSON cannot
//! express (maps with non-string keys, sets, raw bytes) and this walker
//! folds them into their plain form.  Everything too deep to be acyclic
//! falls back to its string rendering, so no call site ever depends on the
//! worker's value representation.

use serde_json::{Map, Value};

use cello_store::RawMediaMap;

/// Recursion ceiling: past this the structure is assumed circular and the
/// value is stringified.
const MAX_DEPTH: usize = 32;

const TAG_FIELD: &str = "__kind__";

/// Fold a worker value into plain data.
pub fn to_plain(value: &Value) -> Value {
    walk(value, 0)
}

fn walk(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return Value::String(stringify(value));
    }
    match value {
        Value::Object(obj) => match obj.get(TAG_FIELD).and_then(Value::as_str) {
            Some("map") => map_to_object(obj, depth),
            Some("set") => set_to_array(obj, depth),
            Some("bytes") => bytes_to_string(obj),
            _ => Value::Object(
                obj.iter().map(|(k, v)| (k.clone(), walk(v, depth + 1))).collect(),
            ),
        },
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| walk(v, depth + 1)).collect())
        }
        scalar => scalar.clone(),
    }
}

/// `{__kind__: "map", entries: [[k, v], …]}` → object keyed by the
/// stringified keys.
fn map_to_object(obj: &Map<String, Value>, depth: usize) -> Value {
    let mut out = Map::new();
    if let Some(entries) = obj.get("entries").and_then(Value::as_array) {
        for pair in entries {
            let Some(pair) = pair.as_array() else { continue };
            let (Some(key), Some(val)) = (pair.first(), pair.get(1)) else { continue };
            out.insert(stringify_key(key), walk(val, depth + 1));
        }
    }
    Value::Object(out)
}

/// `{__kind__: "set", values: […]}` → array.
fn set_to_array(obj: &Map<String, Value>, depth: usize) -> Value {
    let values = obj
        .get("values")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(|v| walk(v, depth + 1)).collect())
        .unwrap_or_default();
    Value::Array(values)
}

/// `{__kind__: "bytes", base64: "…"}` → the base64 string itself.
fn bytes_to_string(obj: &Map<String, Value>) -> Value {
    obj.get("base64").cloned().unwrap_or(Value::String(String::new()))
}

fn stringify_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => stringify(other),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Interpret a response `result` value as a MIME map with plain values.
/// Non-object results become a lone `text/plain` entry.
pub fn media_map_from_value(value: &Value) -> RawMediaMap {
    match value {
        Value::Object(obj) => {
            obj.iter().map(|(mime, v)| (mime.clone(), to_plain(v))).collect()
        }
        other => [("text/plain".to_string(), Value::String(stringify(other)))]
            .into_iter()
            .collect(),
    }
}

/// Fold every entry of a streamed MIME map.
pub fn plain_media_map(data: &std::collections::BTreeMap<String, Value>) -> RawMediaMap {
    data.iter().map(|(mime, v)| (mime.clone(), to_plain(v))).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
