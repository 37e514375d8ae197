use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::diff::{self, FieldChange};
use super::filter::{self, Where};
use super::path;
use crate::error::{DbError, DbResult};

/// A JSON object addressed by dotted paths.
///
/// The value lives behind an `Arc`; mutation is copy-on-write so a
/// [`snapshot`](Document::snapshot) handed to another reader is never
/// observed half-written. Cloning is cheap.
#[derive(Clone, PartialEq)]
pub struct Document {
    value: Arc<Value>,
}

impl Document {
    /// Creates an empty document
    pub fn new() -> Self {
        Self {
            value: Arc::new(Value::Object(Map::new())),
        }
    }

    /// Wraps a JSON value; the root must be an object
    pub fn from_value(value: Value) -> DbResult<Self> {
        if !value.is_object() {
            return Err(DbError::validation(format!(
                "document root must be an object, got {}",
                type_name(&value)
            )));
        }
        Ok(Self {
            value: Arc::new(value),
        })
    }

    /// Converts any serializable value into a document
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> DbResult<Self> {
        Self::from_value(serde_json::to_value(value)?)
    }

    /// Decodes canonical JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> DbResult<Self> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    /// Encodes to canonical JSON bytes, preserving key order
    pub fn to_bytes(&self) -> DbResult<Vec<u8>> {
        Ok(serde_json::to_vec(self.value.as_ref())?)
    }

    /// Deserializes the document into a typed value
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> DbResult<T> {
        Ok(T::deserialize(self.value.as_ref())?)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        Arc::try_unwrap(self.value).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Shares the current immutable value
    pub fn snapshot(&self) -> Arc<Value> {
        Arc::clone(&self.value)
    }

    /// Top-level fields in insertion order
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.value.as_object().into_iter().flat_map(|map| map.iter())
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        path::get(&self.value, path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// String form of a key field; numbers are stringified, empty strings
    /// and non-scalars yield `None`
    pub fn key_string(&self, path: &str) -> Option<String> {
        value_to_key(self.get(path)?)
    }

    /// Document id stored under `primary_key`
    pub fn id(&self, primary_key: &str) -> Option<String> {
        self.key_string(primary_key)
    }

    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> DbResult<()> {
        path::set(Arc::make_mut(&mut self.value), path, value.into())
    }

    /// Sets every `(path, value)` pair in order
    pub fn set_all<I, K>(&mut self, values: I) -> DbResult<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let root = Arc::make_mut(&mut self.value);
        for (path, value) in values {
            path::set(root, path.as_ref(), value)?;
        }
        Ok(())
    }

    /// Removes each path; missing paths are ignored
    pub fn delete<I, K>(&mut self, paths: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let root = Arc::make_mut(&mut self.value);
        for p in paths {
            path::delete(root, p.as_ref());
        }
    }

    /// Copy restricted to `fields`; absent fields are skipped
    pub fn select<K: AsRef<str>>(&self, fields: &[K]) -> DbResult<Document> {
        let mut out = Document::new();
        for field in fields {
            if let Some(value) = self.get(field.as_ref()) {
                out.set(field.as_ref(), value.clone())?;
            }
        }
        Ok(out)
    }

    /// Flattened union with `other`; `other` wins on conflicts
    pub fn merge(&mut self, other: &Document) -> DbResult<()> {
        self.set_all(other.flatten())
    }

    /// Evaluates all predicates (AND)
    pub fn matches(&self, predicates: &[Where]) -> DbResult<bool> {
        filter::matches_all(&self.value, predicates)
    }

    /// Changes turning `before` into `self`
    pub fn diff(&self, before: &Document) -> Vec<FieldChange> {
        diff::diff(&before.value, &self.value)
    }

    /// Replays patch operations in place
    pub fn apply(&mut self, changes: &[FieldChange]) -> DbResult<()> {
        diff::apply(Arc::make_mut(&mut self.value), changes)
    }

    pub fn flatten(&self) -> Map<String, Value> {
        path::flatten(&self.value)
    }

    pub fn unflatten(flat: &Map<String, Value>) -> DbResult<Document> {
        Self::from_value(path::unflatten(flat)?)
    }
}

/// String key for a scalar JSON value
pub fn value_to_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<Value> for Document {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Document({})", self.value)
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Document::from_value(value).map_err(serde::de::Error::custom)
    }
}
