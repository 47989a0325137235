//! Typed getters and setters over a schemaless JSON tree.
//!
//! Controllers traverse federated and target bodies without schemas; this
//! module keeps that traversal in one place so schema-awareness stays
//! confined to the override engine.

use serde_json::{Map, Value};

/// Walk object keys and array indices. Returns `None` on any missing segment.
pub fn get<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = v;
    for seg in path {
        cur = match cur {
            Value::Object(map) => map.get(*seg)?,
            Value::Array(arr) => arr.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

pub fn get_str<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    get(v, path).and_then(Value::as_str)
}

pub fn get_i64(v: &Value, path: &[&str]) -> Option<i64> {
    get(v, path).and_then(Value::as_i64)
}

pub fn get_bool(v: &Value, path: &[&str]) -> Option<bool> {
    get(v, path).and_then(Value::as_bool)
}

/// Set a value, creating missing intermediate objects. Only object segments
/// are created; indexing into a non-array fails silently by replacing the
/// slot with an object, which callers never want for arrays, so array
/// segments must already exist.
pub fn set(v: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *v = value;
        return;
    };
    let mut cur = v;
    for seg in parents {
        let next = match cur {
            Value::Array(arr) => match seg.parse::<usize>() {
                Ok(idx) if idx < arr.len() => &mut arr[idx],
                _ => return,
            },
            Value::Object(map) => map.entry(seg.to_string()).or_insert(Value::Null),
            other => {
                *other = Value::Object(Map::new());
                match other {
                    Value::Object(map) => map.entry(seg.to_string()).or_insert(Value::Null),
                    _ => return,
                }
            }
        };
        if !next.is_object() && !next.is_array() {
            *next = Value::Object(Map::new());
        }
        cur = next;
    }
    match cur {
        Value::Array(arr) => {
            if let Ok(idx) = last.parse::<usize>() {
                if idx < arr.len() {
                    arr[idx] = value;
                }
            }
        }
        Value::Object(map) => {
            map.insert(last.to_string(), value);
        }
        other => {
            let mut map = Map::new();
            map.insert(last.to_string(), value);
            *other = Value::Object(map);
        }
    }
}

/// Remove and return the value at `path`, if present.
pub fn remove(v: &mut Value, path: &[&str]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut cur = v;
    for seg in parents {
        cur = match cur {
            Value::Object(map) => map.get_mut(*seg)?,
            Value::Array(arr) => arr.get_mut(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match cur {
        Value::Object(map) => map.remove(*last),
        Value::Array(arr) => {
            let idx = last.parse::<usize>().ok()?;
            if idx < arr.len() {
                Some(arr.remove(idx))
            } else {
                None
            }
        }
        _ => None,
    }
}
