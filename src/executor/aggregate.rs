//! Grouping and aggregation
//!
//! Documents are grouped by the composite value of the `group_by` fields,
//! in order of first appearance. Each group reduces to one document holding
//! the group fields and one value per aggregate select.

use std::collections::HashMap;

use serde_json::{Number, Value};

use crate::document::{to_f64, Document};
use crate::error::DbResult;
use crate::planner::{AggregateFunction, Select};

/// Groups documents by the values of `group_by`; missing fields group as null
pub fn group_by(documents: Vec<Document>, group_by: &[String]) -> Vec<Vec<Document>> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<Document>> = Vec::new();
    for doc in documents {
        let key = Value::Array(
            group_by
                .iter()
                .map(|field| doc.get(field).cloned().unwrap_or(Value::Null))
                .collect(),
        )
        .to_string();
        match positions.get(&key) {
            Some(&i) => groups[i].push(doc),
            None => {
                positions.insert(key, groups.len());
                groups.push(vec![doc]);
            }
        }
    }
    groups
}

/// Reduces one group into its output document
pub fn reduce(group: &[Document], group_by: &[String], selects: &[Select]) -> DbResult<Document> {
    let mut out = Document::new();
    if let Some(first) = group.first() {
        for field in group_by {
            let value = first.get(field).cloned().unwrap_or(Value::Null);
            let name = selects
                .iter()
                .find(|s| s.aggregate.is_none() && &s.field == field)
                .map(|s| s.output_name())
                .unwrap_or_else(|| field.clone());
            out.set(&name, value)?;
        }
    }
    for select in selects {
        if let Some(function) = select.aggregate {
            out.set(&select.output_name(), apply(function, group, &select.field))?;
        }
    }
    Ok(out)
}

/// Groups then reduces every group
pub fn aggregate(
    documents: Vec<Document>,
    group_fields: &[String],
    selects: &[Select],
) -> DbResult<Vec<Document>> {
    group_by(documents, group_fields)
        .iter()
        .map(|group| reduce(group, group_fields, selects))
        .collect()
}

fn apply(function: AggregateFunction, group: &[Document], field: &str) -> Value {
    if function == AggregateFunction::Count {
        return Value::from(group.len() as u64);
    }
    let values: Vec<f64> = group
        .iter()
        .filter_map(|doc| doc.get(field).and_then(to_f64))
        .collect();
    let result = match function {
        AggregateFunction::Sum => Some(values.iter().sum()),
        AggregateFunction::Min => values.iter().copied().reduce(f64::min),
        AggregateFunction::Max => values.iter().copied().reduce(f64::max),
        AggregateFunction::Avg if !values.is_empty() => {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
        AggregateFunction::Avg | AggregateFunction::Count => None,
    };
    result
        .and_then(Number::from_f64)
        .map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs() -> Vec<Document> {
        [
            json!({"_id": "1", "account_id": "a", "age": 10}),
            json!({"_id": "2", "account_id": "b", "age": 30}),
            json!({"_id": "3", "account_id": "a", "age": 20}),
            json!({"_id": "4", "account_id": "a", "age": "x"}),
        ]
        .into_iter()
        .map(|v| Document::from_value(v).unwrap())
        .collect()
    }

    #[test]
    fn test_group_by_first_appearance() {
        let groups = group_by(docs(), &["account_id".to_string()]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[1][0].key_string("_id").unwrap(), "2");
    }

    #[test]
    fn test_aggregate_functions() {
        let selects = vec![
            Select::field("account_id"),
            Select::aggregate(AggregateFunction::Count, "_id"),
            Select::aggregate(AggregateFunction::Sum, "age").alias("total"),
            Select::aggregate(AggregateFunction::Min, "age"),
            Select::aggregate(AggregateFunction::Max, "age"),
            Select::aggregate(AggregateFunction::Avg, "age"),
        ];
        let out = aggregate(docs(), &["account_id".to_string()], &selects).unwrap();
        assert_eq!(out.len(), 2);

        let a = &out[0];
        assert_eq!(a.get("account_id"), Some(&json!("a")));
        assert_eq!(a.get("count__id"), Some(&json!(3)));
        assert_eq!(a.get("total"), Some(&json!(30.0)));
        assert_eq!(a.get("min_age"), Some(&json!(10.0)));
        assert_eq!(a.get("max_age"), Some(&json!(20.0)));
        assert_eq!(a.get("avg_age"), Some(&json!(15.0)));
    }

    #[test]
    fn test_aggregate_without_numeric_values() {
        let group = vec![Document::from_value(json!({"_id": "1", "age": "x"})).unwrap()];
        assert_eq!(apply(AggregateFunction::Min, &group, "age"), Value::Null);
        assert_eq!(apply(AggregateFunction::Avg, &group, "age"), Value::Null);
        assert_eq!(apply(AggregateFunction::Sum, &group, "age"), json!(0.0));
    }

    #[test]
    fn test_aggregate_whole_collection() {
        let out = aggregate(
            docs(),
            &[],
            &[Select::aggregate(AggregateFunction::Count, "_id").alias("n")],
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("n"), Some(&json!(4)));
    }
}
