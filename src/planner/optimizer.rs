//! Index selection
//!
//! Rule-based selection:
//! 1. Equality on the primary key: point lookup on the primary index
//! 2. Otherwise the secondary index with the most contiguous leading fields
//!    fixed by equality; ties prefer an index whose first field is the first
//!    sort key, then schema order
//! 3. Otherwise a full scan of the primary index
//!
//! A range predicate on the next unmatched field of the chosen index sets
//! the scan's start when its bound is a non-numeric string. Every predicate is still applied as a post-filter.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::trace;

use super::ast::OrderBy;
use super::explain::Explain;
use crate::document::{to_f64, value_to_key, Where, WhereOp};
use crate::error::DbResult;
use crate::schema::{CollectionSchema, Index};

/// Chooses the index a query scans
pub trait Optimizer: Send + Sync {
    fn optimize(
        &self,
        schema: &CollectionSchema,
        filter: &[Where],
        order_by: &[OrderBy],
    ) -> DbResult<Explain>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOptimizer;

impl DefaultOptimizer {
    pub fn new() -> Self {
        Self
    }
}

impl Optimizer for DefaultOptimizer {
    fn optimize(
        &self,
        schema: &CollectionSchema,
        filter: &[Where],
        order_by: &[OrderBy],
    ) -> DbResult<Explain> {
        let primary = schema.primary_index()?;
        let equalities = equality_values(filter);
        let sort_field = order_by.first().map(|o| o.field.as_str());

        let mut explain = match equalities
            .get(schema.primary_key.as_str())
            .and_then(|v| value_to_key(v))
        {
            Some(id) => {
                let mut explain = Explain::full_scan(&schema.collection, &primary.name, true);
                explain.matched_fields.push(schema.primary_key.clone());
                explain
                    .matched_values
                    .insert(schema.primary_key.clone(), Value::String(id));
                explain
            }
            None => best_secondary(schema, primary, &equalities, sort_field),
        };

        let chosen = schema
            .index(&explain.index)
            .unwrap_or(primary);
        explain.is_ordered = match sort_field {
            Some(field) => chosen.fields.first().is_some_and(|f| f == field),
            None => chosen.primary,
        };
        if let Some(next) = chosen.fields.get(explain.matched_fields.len()) {
            if let Some(range) = filter
                .iter()
                .find(|w| &w.field == next && w.op.is_range() && !w.is_self_ref() && seekable(&w.value))
            {
                explain.seek_fields.push(next.clone());
                explain.seek_values.insert(next.clone(), range.value.clone());
                explain.seek_op = Some(range.op);
                explain.reverse = matches!(range.op, WhereOp::Lt | WhereOp::Lte);
            }
        }

        trace!(
            target: "docudb::planner",
            collection = %schema.collection,
            index = %explain.index,
            matched = explain.matched_fields.len(),
            seek = ?explain.seek_op,
            "index selected"
        );
        Ok(explain)
    }
}

/// Whether a range bound can narrow the scan.
///
/// Range predicates compare numbers, numeric strings and bools as `f64`
/// while the codec orders each JSON type apart, so only a non-numeric
/// string bounds every entry the predicate accepts.
fn seekable(bound: &Value) -> bool {
    bound.is_string() && to_f64(bound).is_none()
}

/// Equality values by field; the last predicate on a field wins
fn equality_values(filter: &[Where]) -> HashMap<&str, &Value> {
    filter
        .iter()
        .filter(|w| w.op == WhereOp::Eq && !w.is_self_ref())
        .map(|w| (w.field.as_str(), &w.value))
        .collect()
}

fn best_secondary(
    schema: &CollectionSchema,
    primary: &Index,
    equalities: &HashMap<&str, &Value>,
    sort_field: Option<&str>,
) -> Explain {
    let mut best: Option<(&Index, usize, bool)> = None;
    for index in schema.secondary_indexes() {
        let matched = index
            .fields
            .iter()
            .take_while(|f| equalities.contains_key(f.as_str()))
            .count();
        if matched == 0 {
            continue;
        }
        let ordered = sort_field.is_some_and(|s| index.fields.first().is_some_and(|f| f == s));
        let better = match best {
            None => true,
            Some((_, best_matched, best_ordered)) => {
                matched > best_matched || (matched == best_matched && ordered && !best_ordered)
            }
        };
        if better {
            best = Some((index, matched, ordered));
        }
    }

    match best {
        Some((index, matched, _)) => {
            let mut explain = Explain::full_scan(&schema.collection, &index.name, false);
            let mut values = Map::new();
            for field in index.fields.iter().take(matched) {
                if let Some(value) = equalities.get(field.as_str()) {
                    values.insert(field.clone(), (*value).clone());
                }
            }
            explain.matched_fields = index.fields[..matched].to_vec();
            explain.matched_values = values;
            explain
        }
        None => Explain::full_scan(&schema.collection, &primary.name, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ast::OrderBy;
    use crate::schema::PRIMARY_INDEX_NAME;
    use serde_json::json;

    fn schema() -> CollectionSchema {
        CollectionSchema::new("user")
            .with_index(Index::new("account_email_idx", ["account_id", "contact.email"]))
            .with_index(Index::new("name_idx", ["name"]))
            .with_index(Index::new("account_age_idx", ["account_id", "age"]))
    }

    fn optimize(filter: &[Where], order_by: &[OrderBy]) -> Explain {
        DefaultOptimizer::new().optimize(&schema(), filter, order_by).unwrap()
    }

    #[test]
    fn test_composite_match() {
        let explain = optimize(
            &[Where::eq("account_id", "1"), Where::eq("contact.email", "a@x")],
            &[],
        );
        assert_eq!(explain.index, "account_email_idx");
        assert_eq!(explain.matched_fields, vec!["account_id", "contact.email"]);
        assert_eq!(explain.matched_values["contact.email"], json!("a@x"));
        assert!(!explain.is_primary);
    }

    #[test]
    fn test_non_leading_field_falls_back_to_primary() {
        let explain = optimize(&[Where::eq("contact.email", "a@x")], &[]);
        assert_eq!(explain.index, PRIMARY_INDEX_NAME);
        assert!(explain.matched_fields.is_empty());
        assert!(explain.is_primary);
        assert!(explain.is_full_scan());
    }

    #[test]
    fn test_primary_key_point_lookup() {
        let explain = optimize(&[Where::eq("account_id", "1"), Where::eq("_id", 7)], &[]);
        assert!(explain.is_primary);
        assert_eq!(explain.matched_fields, vec!["_id"]);
        assert_eq!(explain.matched_values["_id"], json!("7"));
    }

    #[test]
    fn test_tie_prefers_sort_field_then_schema_order() {
        let explain = optimize(&[Where::eq("account_id", "1")], &[]);
        assert_eq!(explain.index, "account_email_idx");

        let schema = CollectionSchema::new("user")
            .with_index(Index::new("by_account", ["account_id"]))
            .with_index(Index::new("by_account_name", ["account_id", "name"]));
        let explain = DefaultOptimizer
            .optimize(&schema, &[Where::eq("account_id", "1")], &[OrderBy::asc("account_id")])
            .unwrap();
        assert_eq!(explain.index, "by_account");
        assert!(explain.is_ordered);
    }

    #[test]
    fn test_last_equality_wins() {
        let explain = optimize(&[Where::eq("name", "a"), Where::eq("name", "b")], &[]);
        assert_eq!(explain.index, "name_idx");
        assert_eq!(explain.matched_values["name"], json!("b"));
    }

    #[test]
    fn test_range_seek_on_next_field() {
        let explain = optimize(
            &[
                Where::eq("account_id", "1"),
                Where::lt("age", 30),
                Where::gt("age", 10),
            ],
            &[],
        );
        // account_email_idx and account_age_idx tie; schema order keeps the first
        assert_eq!(explain.index, "account_email_idx");
        assert!(explain.seek_op.is_none());

        let schema = CollectionSchema::new("user")
            .with_index(Index::new("account_name_idx", ["account_id", "name"]));
        let explain = DefaultOptimizer
            .optimize(
                &schema,
                &[Where::eq("account_id", "1"), Where::lt("name", "m"), Where::gt("name", "c")],
                &[],
            )
            .unwrap();
        assert_eq!(explain.seek_fields, vec!["name"]);
        assert_eq!(explain.seek_op, Some(WhereOp::Lt));
        assert!(explain.reverse);
    }

    #[test]
    fn test_numeric_bounds_do_not_seek() {
        let schema = CollectionSchema::new("user")
            .with_index(Index::new("account_age_idx", ["account_id", "age"]));
        for bound in [json!(30), json!("30"), json!(true)] {
            let explain = DefaultOptimizer
                .optimize(
                    &schema,
                    &[Where::eq("account_id", "1"), Where::new("age", WhereOp::Lt, bound)],
                    &[],
                )
                .unwrap();
            assert_eq!(explain.index, "account_age_idx");
            assert_eq!(explain.matched_fields, vec!["account_id"]);
            assert!(explain.seek_op.is_none());
            assert!(!explain.reverse);
        }

        let explain = optimize(&[Where::lt("_id", 100)], &[]);
        assert!(explain.is_primary);
        assert!(explain.is_full_scan());
    }

    #[test]
    fn test_primary_key_range() {
        let explain = optimize(&[Where::gte("_id", "u5")], &[]);
        assert!(explain.is_primary);
        assert_eq!(explain.seek_op, Some(WhereOp::Gte));
        assert!(!explain.reverse);
    }

    #[test]
    fn test_non_comparable_operators_ignored() {
        let explain = optimize(
            &[
                Where::new("account_id", WhereOp::In, json!(["1", "2"])),
                Where::new("name", WhereOp::HasPrefix, "a"),
                Where::eq("name", "$.nickname"),
            ],
            &[],
        );
        assert!(explain.is_primary);
        assert!(explain.is_full_scan());
    }
}
