//! Transactions
//!
//! A [`Transaction`] wraps one KV transaction. Mutations go through the
//! persist engine; reads go through the query engine and observe the
//! transaction's own writes. Change records are published only after a
//! successful commit.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::command::{Action, Command};
use super::persist::Persister;
use crate::cdc::Cdc;
use crate::context::Context;
use crate::db::DbInner;
use crate::document::{Document, Where};
use crate::error::{DbError, DbResult};
use crate::executor::{Page, QueryEngine};
use crate::kv::KvTx;
use crate::planner::{Explain, Query};

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxState::Open => "open",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled back",
        })
    }
}

/// Database transaction.
///
/// Dropping an open transaction rolls it back.
pub struct Transaction {
    db: Arc<DbInner>,
    ctx: Context,
    kv: Option<Box<dyn KvTx>>,
    read_only: bool,
    state: TxState,
    pending: Vec<Cdc>,
}

impl Transaction {
    pub(crate) fn new(db: Arc<DbInner>, ctx: Context, kv: Box<dyn KvTx>) -> Self {
        Self {
            read_only: kv.is_read_only(),
            db,
            ctx,
            kv: Some(kv),
            state: TxState::Open,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Change records staged by this transaction
    pub fn cdc(&self) -> &[Cdc] {
        &self.pending
    }

    /// Inserts a new document, assigning a time-ordered id when the primary
    /// key is absent. Returns the document id.
    pub fn create(&mut self, collection: &str, mut document: Document) -> DbResult<String> {
        let schema = self.db.schemas.get(collection)?;
        let id = match document.key_string(&schema.primary_key) {
            Some(id) => id,
            None => {
                let id = Uuid::now_v7().to_string();
                document.set(&schema.primary_key, id.clone())?;
                id
            }
        };
        self.apply(Command::new(collection, Action::Create, document))?;
        Ok(id)
    }

    /// Inserts or replaces a document; the primary key is required
    pub fn set(&mut self, collection: &str, document: Document) -> DbResult<String> {
        let schema = self.db.schemas.get(collection)?;
        let id = document.key_string(&schema.primary_key).ok_or_else(|| {
            DbError::validation(format!(
                "{}.{}: missing or empty primary key",
                collection, schema.primary_key
            ))
        })?;
        self.apply(Command::new(collection, Action::Set, document))?;
        Ok(id)
    }

    /// Merges `partial` onto the existing document
    pub fn update(&mut self, collection: &str, id: &str, mut partial: Document) -> DbResult<()> {
        let schema = self.db.schemas.get(collection)?;
        match partial.key_string(&schema.primary_key) {
            Some(existing) if existing != id => {
                return Err(DbError::validation(format!(
                    "{}.{}: immutable value '{}', attempted change to '{}'",
                    collection, schema.primary_key, id, existing
                )));
            }
            _ => partial.set(&schema.primary_key, id)?,
        }
        self.apply(Command::new(collection, Action::Update, partial))
    }

    pub fn delete(&mut self, collection: &str, id: &str) -> DbResult<()> {
        let schema = self.db.schemas.get(collection)?;
        let mut key = Document::new();
        key.set(&schema.primary_key, id)?;
        self.apply(Command::new(collection, Action::Delete, key))
    }

    /// Fetches a document by id
    pub fn get(&self, collection: &str, id: &str) -> DbResult<Document> {
        self.engine()?
            .get(collection, id)?
            .ok_or_else(|| DbError::not_found(collection, id))
    }

    pub fn query(&self, collection: &str, query: &Query) -> DbResult<Page> {
        let engine = self.engine()?;
        if query.limit == 0 && self.db.config.default_limit > 0 {
            let limited = query.clone().limit(self.db.config.default_limit);
            return engine.query(collection, &limited);
        }
        engine.query(collection, query)
    }

    /// Calls `f` for every document matching `filter` until it returns `false`
    pub fn for_each<F>(&self, collection: &str, filter: &[Where], mut f: F) -> DbResult<Explain>
    where
        F: FnMut(Document) -> DbResult<bool>,
    {
        self.engine()?.for_each(collection, filter, &mut f)
    }

    /// Applies one command
    pub fn persist(&mut self, mut command: Command) -> DbResult<()> {
        if command.metadata.is_empty() {
            command.metadata = self.ctx.metadata.clone();
        }
        self.apply_command(command)
    }

    pub fn commit(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        let kv = self.kv.take().ok_or(DbError::TransactionClosed("closed"))?;
        if let Err(e) = kv.commit() {
            self.state = TxState::RolledBack;
            self.pending.clear();
            return Err(e.into());
        }
        self.state = TxState::Committed;
        debug!(
            target: "docudb::tx",
            request_id = %self.ctx.request_id,
            changes = self.pending.len(),
            "transaction committed"
        );
        for cdc in &self.pending {
            self.db.stream.publish(cdc);
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        self.abort();
        Ok(())
    }

    fn apply(&mut self, command: Command) -> DbResult<()> {
        let command = command.with_metadata(self.ctx.metadata.clone());
        self.apply_command(command)
    }

    fn apply_command(&mut self, command: Command) -> DbResult<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(DbError::forbidden(format!(
                "{} on {} in a read-only transaction",
                command.action, command.collection
            )));
        }
        let kv = self
            .kv
            .as_deref_mut()
            .ok_or(DbError::TransactionClosed("closed"))?;

        let mut persister = Persister::new(&self.db, kv);
        let result = persister.persist(&self.ctx, command);
        let wrote = persister.wrote();
        let records = persister.into_records();
        match result {
            Ok(()) => {
                self.pending.extend(records);
                Ok(())
            }
            Err(e) => {
                if wrote {
                    debug!(target: "docudb::tx", error = %e, "command failed after writes, rolling back");
                    self.abort();
                }
                Err(e)
            }
        }
    }

    fn engine(&self) -> DbResult<QueryEngine<'_>> {
        self.ensure_open()?;
        let kv = self
            .kv
            .as_deref()
            .ok_or(DbError::TransactionClosed("closed"))?;
        Ok(QueryEngine::new(
            kv,
            &self.db.schemas,
            self.db.optimizer.as_ref(),
            &self.db.locks,
            &self.ctx,
        ))
    }

    fn ensure_open(&self) -> DbResult<()> {
        match self.state {
            TxState::Open => Ok(()),
            TxState::Committed => Err(DbError::TransactionClosed("committed")),
            TxState::RolledBack => Err(DbError::TransactionClosed("rolled back")),
        }
    }

    fn abort(&mut self) {
        if let Some(kv) = self.kv.take() {
            kv.rollback();
        }
        self.pending.clear();
        self.state = TxState::RolledBack;
        debug!(target: "docudb::tx", request_id = %self.ctx.request_id, "transaction rolled back");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Open {
            self.abort();
        }
    }
}
