//! Structural diff between two documents
//!
//! Produces JSON-patch-like operations over dotted paths. Replaying the
//! operations against `before` with [`apply`] reproduces `after`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::path;
use crate::error::DbResult;

/// Patch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

/// One changed path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub path: String,
    pub op: PatchOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_value: Option<Value>,
}

/// Computes the changes turning `before` into `after`.
///
/// Paths of `before` are walked first (removals and replacements in
/// `before` order), then paths only present in `after` are added.
pub fn diff(before: &Value, after: &Value) -> Vec<FieldChange> {
    let before_flat = path::flatten(before);
    let after_flat = path::flatten(after);
    let mut changes = Vec::new();
    let mut removed: Vec<String> = Vec::new();
    let mut replaced: Vec<String> = Vec::new();

    for (field, before_value) in &before_flat {
        match path::get(after, field) {
            None => {
                // remove at the shallowest ancestor missing from `after`
                let target = path::ancestors(field)
                    .find(|p| path::get(after, p).is_none())
                    .unwrap_or(field)
                    .to_string();
                if removed.iter().any(|r| path::is_within(&target, r)) {
                    continue;
                }
                changes.push(FieldChange {
                    before_value: path::get(before, &target).cloned(),
                    path: target.clone(),
                    op: PatchOp::Remove,
                    value: None,
                });
                removed.push(target);
            }
            Some(after_value) if after_value != before_value => {
                changes.push(FieldChange {
                    path: field.clone(),
                    op: PatchOp::Replace,
                    value: Some(after_value.clone()),
                    before_value: Some(before_value.clone()),
                });
                replaced.push(field.clone());
            }
            Some(_) => {}
        }
    }

    for (field, after_value) in &after_flat {
        if before_flat.contains_key(field) || replaced.iter().any(|r| path::is_within(field, r)) {
            continue;
        }
        match path::get(before, field) {
            None => changes.push(FieldChange {
                path: field.clone(),
                op: PatchOp::Add,
                value: Some(after_value.clone()),
                before_value: None,
            }),
            // `before` held a non-empty object where `after` has a leaf
            Some(before_value) if before_value != after_value => {
                changes.push(FieldChange {
                    path: field.clone(),
                    op: PatchOp::Replace,
                    value: Some(after_value.clone()),
                    before_value: Some(before_value.clone()),
                });
                replaced.push(field.clone());
            }
            Some(_) => {}
        }
    }

    changes
}

/// Replays `changes` onto `target`.
pub fn apply(target: &mut Value, changes: &[FieldChange]) -> DbResult<()> {
    for change in changes {
        match change.op {
            PatchOp::Add | PatchOp::Replace => {
                let value = change.value.clone().unwrap_or(Value::Null);
                path::set(target, &change.path, value)?;
            }
            PatchOp::Remove => {
                path::delete(target, &change.path);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Map};

    fn replay(before: &Value, after: &Value) -> Value {
        let mut out = before.clone();
        apply(&mut out, &diff(before, after)).unwrap();
        out
    }

    #[test]
    fn test_add_replace_remove() {
        let before = json!({"name": "a", "age": 1, "contact": {"email": "x"}});
        let after = json!({"name": "b", "contact": {"email": "x", "phone": "1"}});
        let changes = diff(&before, &after);

        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].path, "name");
        assert_eq!(changes[0].op, PatchOp::Replace);
        assert_eq!(changes[0].before_value, Some(json!("a")));
        assert_eq!(changes[1].path, "age");
        assert_eq!(changes[1].op, PatchOp::Remove);
        assert_eq!(changes[2].path, "contact.phone");
        assert_eq!(changes[2].op, PatchOp::Add);
    }

    #[test]
    fn test_identical_documents() {
        let doc = json!({"a": {"b": [1, 2]}});
        assert!(diff(&doc, &doc).is_empty());
    }

    #[test]
    fn test_remove_collapses_to_missing_parent() {
        let before = json!({"a": {"b": 1, "c": 2}, "d": 1});
        let after = json!({"d": 1});
        let changes = diff(&before, &after);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "a");
        assert_eq!(replay(&before, &after), after);
    }

    #[test]
    fn test_shape_changes_replay() {
        let cases = [
            (json!({"a": 5}), json!({"a": {"b": 1}})),
            (json!({"a": {"b": 1}}), json!({"a": 5})),
            (json!({"a": {"b": 1}}), json!({"a": {}})),
            (json!({"a": {}}), json!({"a": {"b": {"c": 1}}})),
            (json!({}), json!({"a": [1, {"b": 2}]})),
        ];
        for (before, after) in cases {
            assert_eq!(replay(&before, &after), after, "{} -> {}", before, after);
        }
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            (-1000i64..1000).prop_map(|n| json!(n)),
            "[a-z]{0,4}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..3).prop_map(Value::Array),
                prop::collection::vec(("[a-d]{1,2}", inner), 0..4).prop_map(|entries| {
                    Value::Object(entries.into_iter().collect::<Map<_, _>>())
                }),
            ]
        })
    }

    fn arb_object() -> impl Strategy<Value = Value> {
        prop::collection::vec(("[a-d]{1,2}", arb_json()), 0..5)
            .prop_map(|entries| Value::Object(entries.into_iter().collect::<Map<_, _>>()))
    }

    proptest! {
        #[test]
        fn prop_diff_replay_reproduces_after(before in arb_object(), after in arb_object()) {
            prop_assert_eq!(replay(&before, &after), after);
        }
    }
}
