//! Result sorting for query execution
//!
//! Multi-key, stable and deterministic.

use std::cmp::Ordering;

use crate::document::{compare_values, Document};
use crate::planner::{OrderBy, SortDirection};

/// Sorts result documents
pub struct ResultSorter;

impl ResultSorter {
    /// Sorts documents by each key in turn; equal rows keep scan order.
    ///
    /// Ordering rules:
    /// - missing < null < bool < number < string < array/object
    /// - For same types, natural ordering; arrays and objects compare as JSON text
    pub fn sort(documents: &mut [Document], order_by: &[OrderBy]) {
        if order_by.is_empty() {
            return;
        }
        documents.sort_by(|a, b| Self::compare(a, b, order_by));
    }

    fn compare(a: &Document, b: &Document, order_by: &[OrderBy]) -> Ordering {
        for key in order_by {
            let ordering = compare_values(a.get(&key.field), b.get(&key.field));
            let ordering = match key.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_doc(id: &str, age: i64, name: &str) -> Document {
        Document::from_value(json!({"_id": id, "age": age, "name": name})).unwrap()
    }

    fn ids(docs: &[Document]) -> Vec<String> {
        docs.iter().map(|d| d.key_string("_id").unwrap()).collect()
    }

    #[test]
    fn test_sort_ascending_and_descending() {
        let mut docs = vec![make_doc("c", 30, "x"), make_doc("a", 20, "x"), make_doc("b", 25, "x")];
        ResultSorter::sort(&mut docs, &[OrderBy::asc("age")]);
        assert_eq!(ids(&docs), vec!["a", "b", "c"]);

        ResultSorter::sort(&mut docs, &[OrderBy::desc("age")]);
        assert_eq!(ids(&docs), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_sort_stable_multi_key() {
        let mut docs = vec![
            make_doc("a", 25, "bob"),
            make_doc("b", 25, "alice"),
            make_doc("c", 20, "zed"),
            make_doc("d", 25, "alice"),
        ];
        ResultSorter::sort(&mut docs, &[OrderBy::desc("age"), OrderBy::asc("name")]);
        assert_eq!(ids(&docs), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_sort_mixed_types() {
        let mut docs = vec![
            Document::from_value(json!({"_id": "s", "v": "text"})).unwrap(),
            Document::from_value(json!({"_id": "n", "v": 1})).unwrap(),
            Document::from_value(json!({"_id": "m"})).unwrap(),
            Document::from_value(json!({"_id": "b", "v": true})).unwrap(),
        ];
        ResultSorter::sort(&mut docs, &[OrderBy::asc("v")]);
        assert_eq!(ids(&docs), vec!["m", "b", "n", "s"]);
    }
}
