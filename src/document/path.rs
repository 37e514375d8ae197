//! Dotted-path access into JSON values
//!
//! Segments address object keys; on arrays a segment that parses as an
//! unsigned integer addresses an element.

use serde_json::{Map, Value};

use crate::error::{DbError, DbResult};

/// Rejects empty paths and empty segments.
pub fn validate_path(path: &str) -> DbResult<()> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(DbError::validation(format!("invalid path '{}'", path)));
    }
    Ok(())
}

/// Reads the value at `path`.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutable variant of [`get`].
pub fn get_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Writes `value` at `path`, creating intermediate objects.
///
/// Scalar intermediates are replaced with objects. Array elements can be
/// overwritten but not appended.
pub fn set(root: &mut Value, path: &str, value: Value) -> DbResult<()> {
    validate_path(path)?;
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| DbError::validation("empty path"))?;

    let mut current = root;
    for segment in parents {
        current = descend(current, segment)?;
    }

    if !current.is_object() && !current.is_array() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert((*last).to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let slot = array_slot(items, last)?;
            *slot = value;
            Ok(())
        }
        _ => Err(DbError::internal("path container is neither object nor array")),
    }
}

/// Removes the value at `path`, returning it.
pub fn delete(root: &mut Value, path: &str) -> Option<Value> {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (get_mut(root, parent)?, last),
        None => (root, path),
    };
    match parent {
        Value::Object(map) => map.shift_remove(last),
        Value::Array(items) => {
            let index = last.parse::<usize>().ok()?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    }
}

/// Flattens nested objects into dotted paths.
///
/// Arrays, scalars and empty objects are leaves.
pub fn flatten(value: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    if let Value::Object(map) = value {
        flatten_into(map, "", &mut out);
    }
    out
}

/// Rebuilds a nested object from dotted paths.
pub fn unflatten(flat: &Map<String, Value>) -> DbResult<Value> {
    let mut root = Value::Object(Map::new());
    for (path, value) in flat {
        set(&mut root, path, value.clone())?;
    }
    Ok(root)
}

/// Joins a parent path and a key.
pub fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Yields `a`, `a.b`, `a.b.c` for `a.b.c`.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('.')
        .map(move |(i, _)| &path[..i])
        .chain(std::iter::once(path))
}

/// Whether `ancestor` equals `path` or is one of its parents.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'.')
}

fn flatten_into(map: &Map<String, Value>, prefix: &str, out: &mut Map<String, Value>) {
    for (key, value) in map {
        let path = join(prefix, key);
        match value {
            Value::Object(child) if !child.is_empty() => flatten_into(child, &path, out),
            leaf => {
                out.insert(path, leaf.clone());
            }
        }
    }
}

fn descend<'a>(current: &'a mut Value, segment: &str) -> DbResult<&'a mut Value> {
    if !current.is_object() && !current.is_array() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => Ok(map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()))),
        Value::Array(items) => array_slot(items, segment),
        _ => Err(DbError::internal("path container is neither object nor array")),
    }
}

fn array_slot<'a>(items: &'a mut [Value], segment: &str) -> DbResult<&'a mut Value> {
    let len = items.len();
    match segment.parse::<usize>() {
        Ok(index) if index < len => Ok(&mut items[index]),
        _ => Err(DbError::validation(format!(
            "array index '{}' out of bounds (len {})",
            segment, len
        ))),
    }
}
