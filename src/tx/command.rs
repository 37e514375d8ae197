//! Mutation commands

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;
use crate::error::{DbError, DbResult};

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Insert a new document; fails if the id exists
    Create,
    /// Insert or replace
    Set,
    /// Merge a partial document onto an existing one
    Update,
    /// Remove by id
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Set => "set",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mutation applied by a transaction.
///
/// `update` carries the partial document including the primary key;
/// `delete` carries only the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub collection: String,
    pub action: Action,
    pub document: Document,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Command {
    pub fn new(collection: impl Into<String>, action: Action, document: Document) -> Self {
        Self {
            collection: collection.into(),
            action,
            document,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.collection.is_empty() {
            return Err(DbError::validation("command has no collection"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_json() {
        let cmd = Command::new(
            "user",
            Action::Update,
            Document::from_value(json!({"_id": "1", "name": "a"})).unwrap(),
        );
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["action"], json!("update"));
        assert_eq!(value["document"]["name"], json!("a"));
        assert!(value.get("metadata").is_none());

        let back: Command = serde_json::from_value(value).unwrap();
        assert_eq!(back.action, Action::Update);
        assert!(back.validate().is_ok());
    }

    #[test]
    fn test_empty_collection_rejected() {
        let cmd = Command::new("", Action::Delete, Document::new());
        assert!(cmd.validate().is_err());
        assert_eq!(Action::Delete.to_string(), "delete");
    }
}
