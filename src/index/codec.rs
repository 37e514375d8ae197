//! Order-preserving index key codec
//!
//! Key layout, components joined by a NUL separator:
//!
//! ```text
//! "index" \0 <collection> \0 <index> \0 (<field> \0 <value> \0)* <document id>
//! ```
//!
//! Encoded values never contain a NUL byte, so a prefix ending in the
//! separator matches exactly one component boundary and a shorter value
//! always sorts before a longer value it prefixes.
//!
//! Value encoding is a type tag followed by a payload:
//! null < bool < number < string < array/object. Within a type the byte
//! order matches the natural order of the values.

use serde_json::Value;

use crate::error::{DbError, DbResult};

/// Leading component of every index key
pub const INDEX_NAMESPACE: &str = "index";

/// Leading component of reserved engine keys (locks, schemas)
pub const INTERNAL_NAMESPACE: &str = "internal";

/// Component separator
pub const SEPARATOR: u8 = 0x00;

const TAG_NULL: u8 = 0x10;
const TAG_BOOL: u8 = 0x20;
const TAG_NUMBER: u8 = 0x30;
const TAG_STRING: u8 = 0x40;
const TAG_JSON: u8 = 0x50;

const ESCAPE: u8 = 0x01;
const ESCAPED_NUL: u8 = 0x01;
const ESCAPED_ESCAPE: u8 = 0x02;

/// Encodes one field value; the output never contains `0x00`.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut raw = Vec::with_capacity(10);
    match value {
        Value::Null => raw.push(TAG_NULL),
        Value::Bool(b) => {
            raw.push(TAG_BOOL);
            raw.push(u8::from(*b));
        }
        Value::Number(n) => {
            raw.push(TAG_NUMBER);
            raw.extend_from_slice(&ordered_f64_bytes(n.as_f64().unwrap_or(0.0)));
        }
        Value::String(s) => {
            raw.push(TAG_STRING);
            raw.extend_from_slice(s.as_bytes());
        }
        Value::Array(_) | Value::Object(_) => {
            raw.push(TAG_JSON);
            raw.extend_from_slice(value.to_string().as_bytes());
        }
    }
    escape(&raw)
}

/// Inverse of [`encode_value`].
pub fn decode_value(bytes: &[u8]) -> DbResult<Value> {
    let raw = unescape(bytes)?;
    let (tag, payload) = raw
        .split_first()
        .ok_or_else(|| DbError::Encoding("empty index value".to_string()))?;
    match *tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => match payload {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(DbError::Encoding("malformed bool".to_string())),
        },
        TAG_NUMBER => {
            let bits: [u8; 8] = payload
                .try_into()
                .map_err(|_| DbError::Encoding("malformed number".to_string()))?;
            let n = from_ordered_f64_bytes(bits);
            // integers round-trip as integers
            if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                Ok(Value::from(n as i64))
            } else {
                Ok(Value::from(n))
            }
        }
        TAG_STRING => String::from_utf8(payload.to_vec())
            .map(Value::String)
            .map_err(|e| DbError::Encoding(e.to_string())),
        TAG_JSON => Ok(serde_json::from_slice(payload)?),
        other => Err(DbError::Encoding(format!("unknown value tag {:#04x}", other))),
    }
}

/// Immediate lexicographic successor of every key starting with `prefix`.
///
/// Trailing `0xFF` bytes are dropped and the last remaining byte is
/// incremented. An empty result means "no upper bound".
pub fn next_prefix(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last < 0xFF {
            out.push(last + 1);
            return out;
        }
    }
    out
}

/// Full key for one index entry.
pub fn encode_key(
    collection: &str,
    index: &str,
    fields: &[(&str, &Value)],
    document_id: &str,
) -> Vec<u8> {
    let mut key = IndexKey::new(collection, index);
    for (field, value) in fields {
        key = key.append(*field, (*value).clone());
    }
    key.with_document_id(document_id).to_bytes()
}

/// Reserved engine key, e.g. `internal\0lock\0user`
pub fn internal_key(kind: &str, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(INTERNAL_NAMESPACE.len() + kind.len() + name.len() + 2);
    key.extend_from_slice(INTERNAL_NAMESPACE.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(kind.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Builder for index keys and scan prefixes
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKey {
    collection: String,
    index: String,
    fields: Vec<(String, Value)>,
    document_id: Option<String>,
}

impl IndexKey {
    pub fn new(collection: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            index: index.into(),
            fields: Vec::new(),
            document_id: None,
        }
    }

    /// Appends the next indexed field and its value
    pub fn append(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.push((field.into(), value));
        self
    }

    pub fn with_document_id(mut self, id: impl Into<String>) -> Self {
        self.document_id = Some(id.into());
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    /// Every key of this index with these leading field values starts with
    /// the returned bytes; the document id is not included
    pub fn prefix(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        for part in [INDEX_NAMESPACE, self.collection.as_str(), self.index.as_str()] {
            out.extend_from_slice(part.as_bytes());
            out.push(SEPARATOR);
        }
        for (field, value) in &self.fields {
            out.extend_from_slice(field.as_bytes());
            out.push(SEPARATOR);
            out.extend_from_slice(&encode_value(value));
            out.push(SEPARATOR);
        }
        out
    }

    /// Full key; equals [`prefix`](Self::prefix) when no id is set
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.prefix();
        if let Some(id) = &self.document_id {
            out.extend_from_slice(id.as_bytes());
        }
        out
    }

    /// Parses a full key produced by [`to_bytes`](Self::to_bytes)
    pub fn decode(bytes: &[u8]) -> DbResult<Self> {
        let parts: Vec<&[u8]> = bytes.split(|b| *b == SEPARATOR).collect();
        if parts.len() < 4 || parts.len() % 2 != 0 || parts[0] != INDEX_NAMESPACE.as_bytes() {
            return Err(DbError::Encoding("malformed index key".to_string()));
        }
        let text = |raw: &[u8]| {
            String::from_utf8(raw.to_vec()).map_err(|e| DbError::Encoding(e.to_string()))
        };

        let mut key = IndexKey::new(text(parts[1])?, text(parts[2])?);
        let pairs = &parts[3..parts.len() - 1];
        for pair in pairs.chunks(2) {
            key = key.append(text(pair[0])?, decode_value(pair[1])?);
        }
        let id = parts[parts.len() - 1];
        if !id.is_empty() {
            key = key.with_document_id(text(id)?);
        }
        Ok(key)
    }
}

/// Flips the sign bit of positives and every bit of negatives so the
/// big-endian bytes sort like the floats. `-0.0` is folded into `0.0`.
fn ordered_f64_bytes(value: f64) -> [u8; 8] {
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    let ordered = if bits & 0x8000_0000_0000_0000 == 0 {
        bits ^ 0x8000_0000_0000_0000
    } else {
        !bits
    };
    ordered.to_be_bytes()
}

fn from_ordered_f64_bytes(bytes: [u8; 8]) -> f64 {
    let ordered = u64::from_be_bytes(bytes);
    let bits = if ordered & 0x8000_0000_0000_0000 != 0 {
        ordered ^ 0x8000_0000_0000_0000
    } else {
        !ordered
    };
    f64::from_bits(bits)
}

fn escape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 2);
    for &b in raw {
        match b {
            0x00 => out.extend_from_slice(&[ESCAPE, ESCAPED_NUL]),
            ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            b => out.push(b),
        }
    }
    out
}

fn unescape(bytes: &[u8]) -> DbResult<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter();
    while let Some(&b) = iter.next() {
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(&ESCAPED_NUL) => out.push(0x00),
            Some(&ESCAPED_ESCAPE) => out.push(ESCAPE),
            _ => return Err(DbError::Encoding("dangling escape byte".to_string())),
        }
    }
    Ok(out)
}
