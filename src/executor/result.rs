//! Result types for query execution

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::planner::Explain;

/// Statistics collected while producing a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageStats {
    pub execution_time_micros: u64,
    /// Index selection for the query
    pub explain: Explain,
}

/// One page of query results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Documents in result order
    pub documents: Vec<Document>,
    pub next_page: usize,
    /// Number of documents on this page
    pub count: usize,
    pub stats: PageStats,
}

impl Page {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.documents.iter()
    }

    /// Values of `field` across the page, in order
    pub fn values(&self, field: &str) -> Vec<Option<&serde_json::Value>> {
        self.documents.iter().map(|d| d.get(field)).collect()
    }
}

impl IntoIterator for Page {
    type Item = Document;
    type IntoIter = std::vec::IntoIter<Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_json_shape() {
        let page = Page {
            documents: vec![Document::from_value(json!({"_id": "1"})).unwrap()],
            next_page: 1,
            count: 1,
            stats: PageStats {
                execution_time_micros: 5,
                explain: Explain::full_scan("user", "primary_idx", true),
            },
        };
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(value["nextPage"], json!(1));
        assert_eq!(value["stats"]["explain"]["isPrimary"], json!(true));
        assert_eq!(page.values("_id"), vec![Some(&json!("1"))]);
        assert_eq!(page.len(), 1);
    }
}
