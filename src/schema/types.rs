//! Collection schema definitions
//!
//! A collection is described by its primary key, its ordered index list
//! and optional field declarations used for validation. Exactly one index
//! is primary and it covers only the primary key.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;
use crate::error::{DbError, DbResult};
use crate::index::IndexKey;

/// Primary key field used when none is configured
pub const DEFAULT_PRIMARY_KEY: &str = "_id";

/// Name given to the generated primary index
pub const PRIMARY_INDEX_NAME: &str = "primary_idx";

/// Supported field types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldType {
    /// UTF-8 string
    String,
    /// 64-bit signed integer
    Int,
    /// Boolean
    Bool,
    /// Any number
    Float,
    /// Nested object with its own field schema
    Object {
        #[serde(default)]
        fields: BTreeMap<String, FieldDef>,
    },
    /// Homogeneous array
    Array {
        element_type: Box<FieldType>,
    },
    /// Any JSON value
    Any,
}

impl FieldType {
    /// Returns the type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Bool => "bool",
            FieldType::Float => "float",
            FieldType::Object { .. } => "object",
            FieldType::Array { .. } => "array",
            FieldType::Any => "any",
        }
    }
}

/// Field declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(flatten)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl FieldDef {
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
        }
    }

    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
        }
    }

    pub fn required_string() -> Self {
        Self::required(FieldType::String)
    }

    pub fn optional_string() -> Self {
        Self::optional(FieldType::String)
    }

    pub fn required_int() -> Self {
        Self::required(FieldType::Int)
    }

    pub fn optional_int() -> Self {
        Self::optional(FieldType::Int)
    }

    pub fn required_float() -> Self {
        Self::required(FieldType::Float)
    }

    pub fn optional_bool() -> Self {
        Self::optional(FieldType::Bool)
    }

    pub fn optional_object(fields: BTreeMap<String, FieldDef>) -> Self {
        Self::optional(FieldType::Object { fields })
    }

    pub fn optional_array(element_type: FieldType) -> Self {
        Self::optional(FieldType::Array {
            element_type: Box::new(element_type),
        })
    }
}

/// Reference from an indexed field to another collection's primary key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub collection: String,
    /// Delete referencing documents when the target is deleted
    #[serde(default = "default_cascade")]
    pub cascade: bool,
}

fn default_cascade() -> bool {
    true
}

/// Index definition; field order determines key layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKey>,
}

impl Index {
    pub fn new<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
            primary: false,
            foreign_key: None,
        }
    }

    /// Primary index over `primary_key`
    pub fn primary_on(primary_key: impl Into<String>) -> Self {
        let primary_key: String = primary_key.into();
        let mut index = Self::new(PRIMARY_INDEX_NAME, [primary_key]);
        index.primary = true;
        index.unique = true;
        index
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Declares `fields[0]` a foreign key into `collection` (cascading)
    pub fn references(mut self, collection: impl Into<String>) -> Self {
        self.foreign_key = Some(ForeignKey {
            collection: collection.into(),
            cascade: true,
        });
        self
    }

    /// Foreign key without cascade on delete
    pub fn references_restrict(mut self, collection: impl Into<String>) -> Self {
        self.foreign_key = Some(ForeignKey {
            collection: collection.into(),
            cascade: false,
        });
        self
    }

    /// Index key for `doc`; missing fields are indexed as null
    pub fn key_for(&self, collection: &str, doc: &Document, document_id: &str) -> IndexKey {
        let mut key = IndexKey::new(collection, &self.name);
        for field in &self.fields {
            key = key.append(field, doc.get(field).cloned().unwrap_or(Value::Null));
        }
        key.with_document_id(document_id)
    }

    /// Prefix covering every entry of this index
    pub fn prefix(&self, collection: &str) -> Vec<u8> {
        IndexKey::new(collection, &self.name).prefix()
    }
}

/// Collection metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub collection: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default)]
    pub indexes: Vec<Index>,
    /// Declared top-level fields
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDef>,
    /// Reject undeclared fields
    #[serde(default)]
    pub strict: bool,
    /// Only internal contexts may write
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_primary_key() -> String {
    DEFAULT_PRIMARY_KEY.to_string()
}

impl CollectionSchema {
    /// Schema keyed by `_id`
    pub fn new(collection: impl Into<String>) -> Self {
        Self::with_primary_key(collection, DEFAULT_PRIMARY_KEY)
    }

    pub fn with_primary_key(collection: impl Into<String>, primary_key: impl Into<String>) -> Self {
        let primary_key: String = primary_key.into();
        Self {
            collection: collection.into(),
            indexes: vec![Index::primary_on(primary_key.clone())],
            primary_key,
            fields: BTreeMap::new(),
            strict: false,
            read_only: false,
            description: None,
        }
    }

    /// Parses a JSON schema definition, adding the primary index when absent
    pub fn from_json(raw: &str) -> DbResult<Self> {
        let schema: CollectionSchema = serde_json::from_str(raw)?;
        Ok(schema.normalized())
    }

    pub fn with_index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Adds the primary index if no index is marked primary
    pub fn normalized(mut self) -> Self {
        if !self.indexes.iter().any(|i| i.primary) {
            self.indexes.insert(0, Index::primary_on(self.primary_key.clone()));
        }
        self
    }

    pub fn primary_index(&self) -> DbResult<&Index> {
        self.indexes.iter().find(|i| i.primary).ok_or_else(|| {
            DbError::validation(format!("collection {} has no primary index", self.collection))
        })
    }

    pub fn secondary_indexes(&self) -> impl Iterator<Item = &Index> {
        self.indexes.iter().filter(|i| !i.primary)
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Foreign keys by referencing field
    pub fn foreign_keys(&self) -> BTreeMap<&str, &ForeignKey> {
        self.indexes
            .iter()
            .filter_map(|i| Some((i.fields.first()?.as_str(), i.foreign_key.as_ref()?)))
            .collect()
    }

    /// Primary index key for a document id
    pub fn primary_key_for(&self, document_id: &str) -> DbResult<IndexKey> {
        let primary = self.primary_index()?;
        Ok(IndexKey::new(&self.collection, &primary.name)
            .append(&self.primary_key, Value::String(document_id.to_string()))
            .with_document_id(document_id))
    }

    /// Prefix covering every document of the collection
    pub fn primary_prefix(&self) -> DbResult<Vec<u8>> {
        Ok(self.primary_index()?.prefix(&self.collection))
    }

    /// Checks the schema definition itself
    pub fn validate_structure(&self) -> DbResult<()> {
        check_name("collection", &self.collection)?;
        check_name("primary key", &self.primary_key)?;

        let primaries: Vec<&Index> = self.indexes.iter().filter(|i| i.primary).collect();
        match primaries.as_slice() {
            [primary] if primary.fields == [self.primary_key.clone()] => {}
            [_] => {
                return Err(DbError::validation(format!(
                    "primary index of {} must cover exactly [{}]",
                    self.collection, self.primary_key
                )))
            }
            _ => {
                return Err(DbError::validation(format!(
                    "collection {} must have exactly one primary index, found {}",
                    self.collection,
                    primaries.len()
                )))
            }
        }

        let mut names = HashSet::new();
        for index in &self.indexes {
            check_name("index", &index.name)?;
            if !names.insert(index.name.as_str()) {
                return Err(DbError::validation(format!(
                    "duplicate index name {} on {}",
                    index.name, self.collection
                )));
            }
            if index.fields.is_empty() {
                return Err(DbError::validation(format!("index {} has no fields", index.name)));
            }
            for field in &index.fields {
                check_name("indexed field", field)?;
            }
            if let Some(fk) = &index.foreign_key {
                check_name("foreign key collection", &fk.collection)?;
            }
        }
        Ok(())
    }
}

fn check_name(kind: &str, name: &str) -> DbResult<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(DbError::validation(format!("invalid {} name '{}'", kind, name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> CollectionSchema {
        CollectionSchema::new("user")
            .with_index(Index::new("account_email_idx", ["account_id", "contact.email"]))
            .with_index(Index::new("email_idx", ["contact.email"]).unique())
            .with_index(Index::new("account_fk", ["account_id"]).references("account"))
    }

    #[test]
    fn test_schema_structure_valid() {
        let schema = user_schema();
        assert!(schema.validate_structure().is_ok());
        assert_eq!(schema.primary_index().unwrap().fields, vec!["_id"]);
        assert_eq!(schema.secondary_indexes().count(), 3);
    }

    #[test]
    fn test_primary_index_rules() {
        let mut schema = user_schema();
        schema.indexes[0].fields = vec!["email".into()];
        assert!(schema.validate_structure().is_err());

        let mut schema = user_schema();
        schema.indexes.push(Index::primary_on("_id"));
        assert!(schema.validate_structure().is_err());
    }

    #[test]
    fn test_duplicate_and_invalid_names() {
        let schema = user_schema().with_index(Index::new("email_idx", ["x"]));
        assert!(schema.validate_structure().is_err());

        let schema = CollectionSchema::new("bad\0name");
        assert!(schema.validate_structure().is_err());

        let schema = CollectionSchema::new("user").with_index(Index::new("empty", Vec::<String>::new()));
        assert!(schema.validate_structure().is_err());
    }

    #[test]
    fn test_foreign_keys() {
        let schema = user_schema();
        let fks = schema.foreign_keys();
        assert_eq!(fks.len(), 1);
        assert_eq!(fks["account_id"].collection, "account");
        assert!(fks["account_id"].cascade);
    }

    #[test]
    fn test_from_json_adds_primary() {
        let schema = CollectionSchema::from_json(
            r#"{
                "collection": "task",
                "indexes": [{"name": "by_owner", "fields": ["owner"]}],
                "fields": {"title": {"type": "string", "required": true}}
            }"#,
        )
        .unwrap();
        assert_eq!(schema.primary_key, "_id");
        assert!(schema.indexes[0].primary);
        assert!(schema.validate_structure().is_ok());
        assert_eq!(schema.fields["title"], FieldDef::required_string());
    }

    #[test]
    fn test_key_for_missing_field_is_null() {
        let schema = user_schema();
        let index = schema.index("account_email_idx").unwrap();
        let doc = Document::from_value(json!({"_id": "u1", "account_id": "a1"})).unwrap();
        let key = index.key_for("user", &doc, "u1");
        assert_eq!(key.fields()[1], ("contact.email".to_string(), Value::Null));
        assert_eq!(key.document_id(), Some("u1"));
    }
}
