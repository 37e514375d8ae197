//! Document validation against a collection schema
//!
//! Validation semantics:
//! - The primary key is present and non-empty
//! - Required declared fields are present and not null
//! - Declared field types match (ints are accepted where floats are)
//! - Strict schemas reject undeclared fields
//!
//! Validation is deterministic and never mutates the document.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::types::{CollectionSchema, FieldDef, FieldType};
use crate::document::{path, Document};
use crate::error::{DbError, DbResult};

/// Validates documents for one collection
pub struct SchemaValidator<'a> {
    schema: &'a CollectionSchema,
}

impl<'a> SchemaValidator<'a> {
    pub fn new(schema: &'a CollectionSchema) -> Self {
        Self { schema }
    }

    /// Validates a document about to be persisted.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Validation` naming the first offending field.
    pub fn validate_document(&self, doc: &Document) -> DbResult<()> {
        if doc.key_string(&self.schema.primary_key).is_none() {
            return Err(self.error(&self.schema.primary_key, "missing or empty primary key"));
        }
        if let Some(id) = doc.key_string(&self.schema.primary_key) {
            if id.contains('\0') {
                return Err(self.error(&self.schema.primary_key, "primary key contains NUL"));
            }
        }

        let obj = doc
            .value()
            .as_object()
            .ok_or_else(|| DbError::validation("document root must be an object"))?;
        self.validate_object(obj, &self.schema.fields, "", true)
    }

    /// Validates an update, checking primary key immutability.
    pub fn validate_update(&self, existing_id: &str, doc: &Document) -> DbResult<()> {
        match doc.key_string(&self.schema.primary_key) {
            Some(id) if id != existing_id => Err(self.error(
                &self.schema.primary_key,
                &format!("immutable value '{}', attempted change to '{}'", existing_id, id),
            )),
            _ => self.validate_document(doc),
        }
    }

    fn validate_object(
        &self,
        obj: &Map<String, Value>,
        fields: &BTreeMap<String, FieldDef>,
        path_prefix: &str,
        top_level: bool,
    ) -> DbResult<()> {
        if self.schema.strict {
            for key in obj.keys() {
                let declared = fields.contains_key(key)
                    || (top_level && key == &self.schema.primary_key);
                if !declared {
                    return Err(self.error(&path::join(path_prefix, key), "undeclared field"));
                }
            }
        }

        for (field_name, field_def) in fields {
            let field_path = path::join(path_prefix, field_name);
            match obj.get(field_name) {
                Some(Value::Null) | None if field_def.required => {
                    return Err(self.error(&field_path, "required field is missing"));
                }
                Some(Value::Null) | None => {}
                Some(value) => self.validate_value(value, &field_def.field_type, &field_path)?,
            }
        }
        Ok(())
    }

    fn validate_value(&self, value: &Value, expected: &FieldType, field_path: &str) -> DbResult<()> {
        let ok = match expected {
            FieldType::Any => true,
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Float => value.is_number(),
            FieldType::Object { fields } => {
                let obj = value
                    .as_object()
                    .ok_or_else(|| self.type_error(field_path, expected, value))?;
                return self.validate_object(obj, fields, field_path, false);
            }
            FieldType::Array { element_type } => {
                let items = value
                    .as_array()
                    .ok_or_else(|| self.type_error(field_path, expected, value))?;
                for (i, item) in items.iter().enumerate() {
                    self.validate_value(item, element_type, &format!("{}.{}", field_path, i))?;
                }
                true
            }
        };
        if ok {
            Ok(())
        } else {
            Err(self.type_error(field_path, expected, value))
        }
    }

    fn type_error(&self, field_path: &str, expected: &FieldType, actual: &Value) -> DbError {
        self.error(
            field_path,
            &format!("expected {}, got {}", expected.type_name(), json_type_name(actual)),
        )
    }

    fn error(&self, field_path: &str, reason: &str) -> DbError {
        DbError::validation(format!(
            "{}.{}: {}",
            self.schema.collection, field_path, reason
        ))
    }
}

/// Returns the JSON type name for error messages.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
