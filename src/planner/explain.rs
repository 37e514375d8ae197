//! Explain output
//!
//! The optimizer's decision: which index is scanned, which leading fields
//! are fixed by equality, and where the scan starts. Attached to every page
//! so callers can verify index selection.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::WhereOp;
use crate::index::{next_prefix, IndexKey};

/// Index selection and scan bounds for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Explain {
    pub collection: String,
    /// Name of the scanned index
    pub index: String,
    /// Leading index fields fixed by equality predicates
    pub matched_fields: Vec<String>,
    pub matched_values: Map<String, Value>,
    pub is_primary: bool,
    /// The index's leading field is the first sort key
    pub is_ordered: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seek_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub seek_values: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seek_op: Option<WhereOp>,
    pub reverse: bool,
}

impl Explain {
    /// Full scan of `index`
    pub fn full_scan(collection: impl Into<String>, index: impl Into<String>, is_primary: bool) -> Self {
        Self {
            collection: collection.into(),
            index: index.into(),
            matched_fields: Vec::new(),
            matched_values: Map::new(),
            is_primary,
            is_ordered: false,
            seek_fields: Vec::new(),
            seek_values: Map::new(),
            seek_op: None,
            reverse: false,
        }
    }

    /// Point lookup or prefix scan
    pub fn is_full_scan(&self) -> bool {
        self.matched_fields.is_empty() && self.seek_op.is_none()
    }

    /// Key prefix covering every candidate entry
    pub fn scan_prefix(&self) -> Vec<u8> {
        self.matched_key().prefix()
    }

    /// Where iteration starts, if narrowed by a range predicate.
    ///
    /// Forward scans start at the first key `>=` the seek key; reverse
    /// scans at the greatest key `<` it.
    pub fn seek_key(&self) -> Option<Vec<u8>> {
        let op = self.seek_op?;
        let mut key = self.matched_key();
        for field in &self.seek_fields {
            let value = self.seek_values.get(field).cloned().unwrap_or(Value::Null);
            key = key.append(field, value);
        }
        let bound = key.prefix();
        let seek = match op {
            WhereOp::Gt | WhereOp::Lte => next_prefix(&bound),
            _ => bound,
        };
        (!seek.is_empty()).then_some(seek)
    }

    fn matched_key(&self) -> IndexKey {
        self.matched_fields.iter().fold(
            IndexKey::new(&self.collection, &self.index),
            |key, field| {
                let value = self.matched_values.get(field).cloned().unwrap_or(Value::Null);
                key.append(field, value)
            },
        )
    }
}

impl fmt::Display for Explain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== EXPLAIN ===")?;
        writeln!(f, "Collection: {}", self.collection)?;
        writeln!(
            f,
            "Index: {}{}",
            self.index,
            if self.is_primary { " (primary)" } else { "" }
        )?;
        if self.matched_fields.is_empty() {
            writeln!(f, "Scan: full")?;
        } else {
            writeln!(f, "Matched:")?;
            for field in &self.matched_fields {
                let value = self.matched_values.get(field).unwrap_or(&Value::Null);
                writeln!(f, "  - {} == {}", field, value)?;
            }
        }
        if let Some(op) = self.seek_op {
            for field in &self.seek_fields {
                let value = self.seek_values.get(field).unwrap_or(&Value::Null);
                writeln!(f, "Seek: {} {} {}", field, op, value)?;
            }
        }
        writeln!(f, "Ordered: {}", self.is_ordered)?;
        writeln!(f, "Direction: {}", if self.reverse { "reverse" } else { "forward" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::encode_key;
    use serde_json::json;

    fn ranged(op: WhereOp, value: Value) -> Explain {
        let mut explain = Explain::full_scan("user", "age_idx", false);
        explain.seek_fields = vec!["age".into()];
        explain.seek_values.insert("age".into(), value);
        explain.reverse = matches!(op, WhereOp::Lt | WhereOp::Lte);
        explain.seek_op = Some(op);
        explain
    }

    fn entry(age: i64, id: &str) -> Vec<u8> {
        encode_key("user", "age_idx", &[("age", &json!(age))], id)
    }

    #[test]
    fn test_prefix_and_seek() {
        let mut explain = Explain::full_scan("user", "account_idx", false);
        assert!(explain.is_full_scan());
        assert!(explain.seek_key().is_none());

        explain.matched_fields.push("account_id".into());
        explain.matched_values.insert("account_id".into(), json!("a1"));
        let key = encode_key("user", "account_idx", &[("account_id", &json!("a1"))], "u1");
        assert!(key.starts_with(&explain.scan_prefix()));
        assert!(!explain.is_full_scan());
    }

    #[test]
    fn test_seek_bounds_exclusive_and_inclusive() {
        let gte = ranged(WhereOp::Gte, json!(30)).seek_key().unwrap();
        assert!(entry(30, "a") >= gte);
        assert!(entry(29, "z") < gte);

        let gt = ranged(WhereOp::Gt, json!(30)).seek_key().unwrap();
        assert!(entry(30, "z") < gt);
        assert!(entry(31, "a") >= gt);

        let lt = ranged(WhereOp::Lt, json!(30)).seek_key().unwrap();
        assert!(entry(29, "z") < lt);
        assert!(entry(30, "a") >= lt);

        let lte = ranged(WhereOp::Lte, json!(30)).seek_key().unwrap();
        assert!(entry(30, "z") < lte);
        assert!(entry(31, "a") >= lte);
    }

    #[test]
    fn test_display_is_deterministic() {
        let explain = ranged(WhereOp::Gt, json!(30));
        let out = explain.to_string();
        assert_eq!(out, explain.to_string());
        assert!(out.contains("Seek: age gt 30"));
        assert!(out.contains("Index: age_idx"));
    }
}
