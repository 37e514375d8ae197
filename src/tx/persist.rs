//! Command persistence
//!
//! Applies one command to a KV transaction: resolves the schema, checks
//! access, runs hooks, validates, checks constraints, then writes the
//! primary and secondary entries, cascades deletes and records the change.
//!
//! # Invariants
//!
//! - Every check runs before the first write; a rejected command stages nothing
//! - Secondary entries of `before` are removed before those of `after` are written
//! - A cascade never visits the same document twice

use std::collections::HashSet;

use tracing::debug;

use super::command::{Action, Command};
use crate::cdc::{Cdc, CDC_COLLECTION};
use crate::context::Context;
use crate::db::DbInner;
use crate::document::Document;
use crate::error::{DbError, DbResult};
use crate::index::{
    check_foreign_key, check_unique, delete_primary, get_document, put_primary, referencing_ids,
    update_secondary,
};
use crate::kv::KvTx;
use crate::schema::{CollectionSchema, SchemaValidator};

/// Applies commands against one KV transaction
pub(crate) struct Persister<'a> {
    db: &'a DbInner,
    tx: &'a mut dyn KvTx,
    wrote: bool,
    records: Vec<Cdc>,
    visited: HashSet<(String, String)>,
}

impl<'a> Persister<'a> {
    pub(crate) fn new(db: &'a DbInner, tx: &'a mut dyn KvTx) -> Self {
        Self {
            db,
            tx,
            wrote: false,
            records: Vec::new(),
            visited: HashSet::new(),
        }
    }

    /// Whether any write was staged; the caller must roll back on error if so
    pub(crate) fn wrote(&self) -> bool {
        self.wrote
    }

    /// Change records produced so far, in command order
    pub(crate) fn into_records(self) -> Vec<Cdc> {
        self.records
    }

    pub(crate) fn persist(&mut self, ctx: &Context, command: Command) -> DbResult<()> {
        self.visited.clear();
        self.apply(ctx, command, 0)
    }

    fn apply(&mut self, ctx: &Context, command: Command, depth: usize) -> DbResult<()> {
        command.validate()?;
        let schema = self.db.schemas.get(&command.collection)?;
        if !ctx.is_internal() {
            if schema.read_only {
                return Err(DbError::forbidden(format!(
                    "collection {} is read-only",
                    schema.collection
                )));
            }
            self.db.locks.ensure_unlocked(&schema.collection)?;
        }

        let id = command
            .document
            .key_string(&schema.primary_key)
            .ok_or_else(|| {
                DbError::validation(format!(
                    "{}.{}: missing or empty primary key",
                    schema.collection, schema.primary_key
                ))
            })?;

        let before = get_document(&*self.tx, &schema, &id)?;
        match (command.action, &before) {
            (Action::Update | Action::Delete, None) => {
                return Err(DbError::not_found(&schema.collection, &id));
            }
            (Action::Create, Some(_)) => {
                return Err(DbError::AlreadyExists {
                    collection: schema.collection.clone(),
                    id,
                });
            }
            _ => {}
        }

        if !ctx.is_internal() && !self.db.hooks.authorize(ctx, &command, before.as_ref())? {
            return Err(DbError::forbidden(format!(
                "{} on {}/{} denied",
                command.action, schema.collection, id
            )));
        }

        let mut after = match (command.action, &before) {
            (Action::Create | Action::Set, _) => Some(command.document.clone()),
            (Action::Update, Some(existing)) => {
                let mut merged = existing.clone();
                merged.merge(&command.document)?;
                Some(merged)
            }
            (Action::Update, None) | (Action::Delete, _) => None,
        };
        self.db.hooks.fire(
            ctx,
            &schema.collection,
            command.action,
            before.as_ref(),
            after.as_mut(),
        )?;

        if let Some(doc) = &after {
            SchemaValidator::new(&schema).validate_update(&id, doc)?;
            self.check_constraints(&schema, &id, doc)?;
        }

        self.wrote = true;
        match &after {
            Some(doc) => put_primary(self.tx, &schema, &id, doc)?,
            None => delete_primary(self.tx, &schema, &id)?,
        }
        update_secondary(self.tx, &schema, &id, before.as_ref(), after.as_ref())?;
        debug!(
            target: "docudb::tx",
            collection = %schema.collection,
            document_id = %id,
            action = %command.action,
            "command applied"
        );

        if command.action == Action::Delete {
            self.visited.insert((schema.collection.clone(), id.clone()));
            if let Some(deleted) = &before {
                self.cascade(ctx, &command, &schema, deleted, depth)?;
            }
        }

        if self.db.config.cdc_enabled && schema.collection != CDC_COLLECTION {
            let cdc = Cdc::new(&command, &id, before.as_ref(), after.as_ref());
            let record = Command::new(CDC_COLLECTION, Action::Create, Document::from_serialize(&cdc)?);
            self.apply(&Context::internal(), record, depth)?;
            self.records.push(cdc);
        }
        Ok(())
    }

    /// Unique and foreign key checks of every secondary index
    fn check_constraints(&self, schema: &CollectionSchema, id: &str, doc: &Document) -> DbResult<()> {
        for index in schema.secondary_indexes() {
            check_unique(&*self.tx, schema, index, id, doc)?;
            if let Some(fk) = &index.foreign_key {
                let target = self.db.schemas.get(&fk.collection)?;
                check_foreign_key(&*self.tx, schema, index, &target, doc)?;
            }
        }
        Ok(())
    }

    /// Deletes documents referencing `deleted` through cascading foreign
    /// keys; non-cascading references reject the delete.
    fn cascade(
        &mut self,
        ctx: &Context,
        parent: &Command,
        schema: &CollectionSchema,
        deleted: &Document,
        depth: usize,
    ) -> DbResult<()> {
        let Some(parent_id) = deleted.key_string(&schema.primary_key) else {
            return Ok(());
        };
        for (child, index) in self.db.schemas.referencing(&schema.collection) {
            let Some(fk) = &index.foreign_key else {
                continue;
            };
            let ids: Vec<String> = referencing_ids(&*self.tx, &child, &index, &parent_id)?
                .into_iter()
                .filter(|id| !self.visited.contains(&(child.collection.clone(), id.clone())))
                .collect();
            if ids.is_empty() {
                continue;
            }
            if !fk.cascade {
                return Err(DbError::ForeignKeyViolation {
                    collection: child.collection.clone(),
                    field: index.fields.first().cloned().unwrap_or_default(),
                    target_collection: schema.collection.clone(),
                    target_id: parent_id.clone(),
                });
            }
            if depth + 1 > self.db.config.max_cascade_depth {
                return Err(DbError::validation(format!(
                    "cascading delete from {} exceeds depth {}",
                    schema.collection, self.db.config.max_cascade_depth
                )));
            }
            for id in ids {
                // an earlier hop of this cascade may have removed it already
                if self.visited.contains(&(child.collection.clone(), id.clone()))
                    || get_document(&*self.tx, &child, &id)?.is_none()
                {
                    continue;
                }
                let mut key = Document::new();
                key.set(&child.primary_key, id.clone())?;
                let command = Command::new(child.collection.clone(), Action::Delete, key)
                    .with_metadata(parent.metadata.clone());
                debug!(
                    target: "docudb::tx",
                    collection = %child.collection,
                    document_id = %id,
                    parent = %schema.collection,
                    "cascading delete"
                );
                self.apply(ctx, command, depth + 1)?;
            }
        }
        Ok(())
    }
}
