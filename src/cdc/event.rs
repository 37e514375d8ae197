//! Change records
//!
//! One record per applied command, persisted in the reserved `cdc`
//! collection and published to subscribers after commit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::document::{Document, FieldChange};
use crate::schema::{CollectionSchema, Index};
use crate::tx::{Action, Command};

/// Reserved collection holding change records
pub const CDC_COLLECTION: &str = "cdc";

/// Schema of the reserved change collection
pub fn cdc_schema() -> CollectionSchema {
    let mut schema = CollectionSchema::new(CDC_COLLECTION)
        .with_index(Index::new("collection_idx", ["collection"]))
        .with_index(Index::new("document_idx", ["collection", "documentId"]))
        .read_only();
    schema.description = Some("change data capture records".to_string());
    schema
}

/// Change data capture record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cdc {
    #[serde(rename = "_id")]
    pub id: String,
    pub collection: String,
    pub action: Action,
    pub document_id: String,
    /// Document after the change; the removed document for deletes
    pub document: Document,
    pub diff: Vec<FieldChange>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Cdc {
    /// Record for `command` turning `before` into `after`
    pub fn new(
        command: &Command,
        document_id: impl Into<String>,
        before: Option<&Document>,
        after: Option<&Document>,
    ) -> Self {
        let empty = Document::new();
        let diff = after
            .unwrap_or(&empty)
            .diff(before.unwrap_or(&empty));
        let document = after.or(before).cloned().unwrap_or_default();
        Self {
            id: Uuid::now_v7().to_string(),
            collection: command.collection.clone(),
            action: command.action,
            document_id: document_id.into(),
            document,
            diff,
            timestamp: command.timestamp,
            metadata: command.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::PatchOp;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_cdc_diff_per_action() {
        let before = doc(json!({"_id": "1", "name": "a", "age": 1}));
        let after = doc(json!({"_id": "1", "name": "b", "age": 1}));

        let update = Command::new("user", Action::Update, after.clone());
        let cdc = Cdc::new(&update, "1", Some(&before), Some(&after));
        assert_eq!(cdc.diff.len(), 1);
        assert_eq!(cdc.diff[0].op, PatchOp::Replace);
        assert_eq!(cdc.diff[0].before_value, Some(json!("a")));
        assert_eq!(cdc.document, after);

        let create = Command::new("user", Action::Create, after.clone());
        let cdc = Cdc::new(&create, "1", None, Some(&after));
        assert!(cdc.diff.iter().all(|c| c.op == PatchOp::Add));

        let delete = Command::new("user", Action::Delete, doc(json!({"_id": "1"})));
        let cdc = Cdc::new(&delete, "1", Some(&before), None);
        assert!(cdc.diff.iter().all(|c| c.op == PatchOp::Remove));
        assert_eq!(cdc.document, before);
    }

    #[test]
    fn test_cdc_is_a_valid_document() {
        let after = doc(json!({"_id": "1"}));
        let cdc = Cdc::new(&Command::new("user", Action::Set, after.clone()), "1", None, Some(&after));
        let stored = Document::from_serialize(&cdc).unwrap();
        assert_eq!(stored.key_string("_id"), Some(cdc.id.clone()));
        assert_eq!(stored.get("documentId"), Some(&json!("1")));
        assert!(cdc_schema().validate_structure().is_ok());
        assert_eq!(stored.decode::<Cdc>().unwrap(), cdc);
    }
}
