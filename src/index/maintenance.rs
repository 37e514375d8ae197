//! Index maintenance over a KV transaction
//!
//! Primary entries map the primary key to the document bytes. Secondary
//! entries map `(fields..., id)` to the document id; the document itself is
//! always read back through the primary index.
//!
//! # Invariants
//!
//! - Stale secondary entries are deleted before the new entry is written
//! - Constraint checks never write
//! - A unique index holds at most one id per value tuple

use serde_json::{Number, Value};
use tracing::{debug, info};

use crate::context::Context;
use crate::document::{value_to_key, Document};
use crate::error::{DbError, DbResult};
use crate::kv::{IterOptions, KvTx};
use crate::schema::{CollectionSchema, Index};

/// Loads a document by id through the primary index
pub fn get_document(
    tx: &dyn KvTx,
    schema: &CollectionSchema,
    document_id: &str,
) -> DbResult<Option<Document>> {
    let key = schema.primary_key_for(document_id)?.to_bytes();
    match tx.get(&key)? {
        Some(bytes) => Ok(Some(Document::from_bytes(&bytes)?)),
        None => Ok(None),
    }
}

pub fn put_primary(
    tx: &mut dyn KvTx,
    schema: &CollectionSchema,
    document_id: &str,
    doc: &Document,
) -> DbResult<()> {
    let key = schema.primary_key_for(document_id)?.to_bytes();
    tx.set(&key, &doc.to_bytes()?)?;
    Ok(())
}

pub fn delete_primary(
    tx: &mut dyn KvTx,
    schema: &CollectionSchema,
    document_id: &str,
) -> DbResult<()> {
    let key = schema.primary_key_for(document_id)?.to_bytes();
    tx.delete(&key)?;
    Ok(())
}

/// Replaces the secondary entries of one document.
///
/// `before` entries are removed first, then `after` entries are written.
/// Either side may be absent (create or delete).
pub fn update_secondary(
    tx: &mut dyn KvTx,
    schema: &CollectionSchema,
    document_id: &str,
    before: Option<&Document>,
    after: Option<&Document>,
) -> DbResult<()> {
    for index in schema.secondary_indexes() {
        if let Some(before) = before {
            let key = index.key_for(&schema.collection, before, document_id);
            tx.delete(&key.to_bytes())?;
        }
        if let Some(after) = after {
            let key = index.key_for(&schema.collection, after, document_id);
            tx.set(&key.to_bytes(), document_id.as_bytes())?;
        }
    }
    Ok(())
}

/// Fails when another document already holds `doc`'s values in a unique index.
///
/// Documents whose indexed fields are all missing or null are never in conflict.
pub fn check_unique(
    tx: &dyn KvTx,
    schema: &CollectionSchema,
    index: &Index,
    document_id: &str,
    doc: &Document,
) -> DbResult<()> {
    if !index.unique || index.primary {
        return Ok(());
    }
    if index
        .fields
        .iter()
        .all(|f| doc.get(f).map_or(true, |v| v.is_null()))
    {
        return Ok(());
    }

    let prefix = index.key_for(&schema.collection, doc, document_id).prefix();
    let mut it = tx.new_iterator(IterOptions::prefix(prefix))?;
    while it.valid() {
        let existing = entry_document_id(it.value())?;
        if existing != document_id {
            return Err(DbError::UniqueConstraintViolation {
                collection: schema.collection.clone(),
                index: index.name.clone(),
                existing_id: existing,
            });
        }
        it.next();
    }
    Ok(())
}

/// Fails when `doc` references a document that does not exist in `target`.
///
/// A missing or null reference is not checked.
pub fn check_foreign_key(
    tx: &dyn KvTx,
    schema: &CollectionSchema,
    index: &Index,
    target: &CollectionSchema,
    doc: &Document,
) -> DbResult<()> {
    let Some(field) = index.fields.first() else {
        return Ok(());
    };
    let Some(value) = doc.get(field).filter(|v| !v.is_null()) else {
        return Ok(());
    };
    let target_id = value_to_key(value).ok_or_else(|| {
        DbError::validation(format!(
            "{}.{}: foreign key value must be a string, number or bool",
            schema.collection, field
        ))
    })?;

    if get_document(tx, target, &target_id)?.is_none() {
        return Err(DbError::ForeignKeyViolation {
            collection: schema.collection.clone(),
            field: field.clone(),
            target_collection: target.collection.clone(),
            target_id,
        });
    }
    Ok(())
}

/// Ids of the documents in `schema` referencing `target_id` through the
/// first field of `index`.
///
/// A reference matches when its key form equals `target_id`, the same rule
/// [`check_foreign_key`] accepts, so `1` and `"1"` both reference id `1`.
pub fn referencing_ids(
    tx: &dyn KvTx,
    schema: &CollectionSchema,
    index: &Index,
    target_id: &str,
) -> DbResult<Vec<String>> {
    let Some(field) = index.fields.first() else {
        return Ok(Vec::new());
    };
    let mut ids: Vec<String> = Vec::new();
    for value in key_forms(target_id) {
        let prefix = crate::index::IndexKey::new(&schema.collection, &index.name)
            .append(field, value)
            .prefix();
        let mut it = tx.new_iterator(IterOptions::prefix(prefix))?;
        while it.valid() {
            let id = entry_document_id(it.value())?;
            it.next();
            if ids.contains(&id) {
                continue;
            }
            // numbers share one encoding, so `1.0` entries also land under `1`
            let references = get_document(tx, schema, &id)?.is_some_and(|doc| {
                doc.get(field).and_then(value_to_key).as_deref() == Some(target_id)
            });
            if references {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

/// Every scalar whose key form is `id`
fn key_forms(id: &str) -> Vec<Value> {
    let mut forms = vec![Value::String(id.to_string())];
    if let Some(number) = id.parse::<f64>().ok().and_then(Number::from_f64) {
        forms.push(Value::Number(number));
    }
    if let Ok(flag) = id.parse::<bool>() {
        forms.push(Value::Bool(flag));
    }
    forms
}

/// Writes entries of `index` for every document in the collection.
///
/// The index prefix must already be empty. Unique indexes are checked as
/// entries are written. Returns the number of documents indexed.
pub fn rebuild_index(
    ctx: &Context,
    tx: &mut dyn KvTx,
    schema: &CollectionSchema,
    index: &Index,
) -> DbResult<usize> {
    let documents = scan_collection(ctx, tx, schema)?;
    for (id, doc) in &documents {
        ctx.check_cancelled()?;
        check_unique(tx, schema, index, id, doc)?;
        let key = index.key_for(&schema.collection, doc, id);
        tx.set(&key.to_bytes(), id.as_bytes())?;
    }
    info!(
        target: "docudb::index",
        collection = %schema.collection,
        index = %index.name,
        documents = documents.len(),
        "index rebuilt"
    );
    Ok(documents.len())
}

/// Every `(id, document)` of a collection in primary key order
pub fn scan_collection(
    ctx: &Context,
    tx: &dyn KvTx,
    schema: &CollectionSchema,
) -> DbResult<Vec<(String, Document)>> {
    let mut out = Vec::new();
    let mut it = tx.new_iterator(IterOptions::prefix(schema.primary_prefix()?))?;
    while it.valid() {
        ctx.check_cancelled()?;
        let doc = Document::from_bytes(it.value())?;
        let id = doc.key_string(&schema.primary_key).ok_or_else(|| {
            DbError::internal(format!(
                "stored document in {} has no primary key",
                schema.collection
            ))
        })?;
        out.push((id, doc));
        it.next();
    }
    debug!(
        target: "docudb::index",
        collection = %schema.collection,
        documents = out.len(),
        "collection scanned"
    );
    Ok(out)
}

/// Document id stored as the value of a secondary entry
pub fn entry_document_id(value: &[u8]) -> DbResult<String> {
    String::from_utf8(value.to_vec()).map_err(|e| DbError::Encoding(e.to_string()))
}
