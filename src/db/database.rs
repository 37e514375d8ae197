//! Database handle
//!
//! Owns the schema registry, optimizer, change stream, lock manager and
//! hooks for one KV store. Cloning the handle is cheap; every clone shares
//! the same state.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cdc::{cdc_schema, ChangeStream, ChangeStreamTask, ChangeSubscription, Cdc, CDC_COLLECTION};
use crate::config::DbConfig;
use crate::context::Context;
use crate::document::Document;
use crate::error::{DbError, DbResult};
use crate::executor::Page;
use crate::hooks::{Authorizer, HookRegistry, Trigger};
use crate::index::{internal_key, rebuild_index, IndexKey};
use crate::kv::{IterOptions, KvStore, KvStoreExt, KvTx, MemoryKv, TxOptions};
use crate::lock::CollectionLocks;
use crate::planner::{DefaultOptimizer, Explain, Optimizer, Query};
use crate::schema::{CollectionSchema, Index, SchemaRegistry};
use crate::tx::{Action, Transaction};

/// Namespace of persisted schemas under the internal prefix
pub const SCHEMA_KIND: &str = "schema";

/// State shared by every handle and transaction
pub(crate) struct DbInner {
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) config: DbConfig,
    pub(crate) schemas: SchemaRegistry,
    pub(crate) optimizer: Box<dyn Optimizer>,
    pub(crate) locks: CollectionLocks,
    pub(crate) hooks: HookRegistry,
    pub(crate) stream: ChangeStream,
    closed: AtomicBool,
}

/// Embedded document database
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

/// Index changes needed to move a collection from one schema to another
#[derive(Debug, Default)]
struct IndexPlan {
    /// Indexes whose entries must be written from the primary index
    rebuild: Vec<Index>,
    /// Prefixes to clear before rebuilding
    drop: Vec<Index>,
}

impl IndexPlan {
    fn between(previous: Option<&CollectionSchema>, next: &CollectionSchema) -> Self {
        let mut plan = IndexPlan::default();
        let old: Vec<&Index> = previous
            .map(|p| p.secondary_indexes().collect())
            .unwrap_or_default();
        for index in next.secondary_indexes() {
            match old.iter().find(|o| o.name == index.name) {
                Some(o) if *o == index => {}
                _ => {
                    plan.rebuild.push(index.clone());
                    plan.drop.push(index.clone());
                }
            }
        }
        for index in old {
            let kept = next.secondary_indexes().any(|i| i.name == index.name);
            if !kept {
                plan.drop.push(index.clone());
            }
        }
        plan
    }

    fn is_empty(&self) -> bool {
        self.rebuild.is_empty() && self.drop.is_empty()
    }
}

impl Database {
    /// Opens a database over `store`, loading persisted schemas
    pub fn open(store: Arc<dyn KvStore>, config: DbConfig) -> DbResult<Self> {
        Self::with_optimizer(store, config, Box::new(DefaultOptimizer::new()))
    }

    /// Opens a database with a custom query optimizer
    pub fn with_optimizer(
        store: Arc<dyn KvStore>,
        config: DbConfig,
        optimizer: Box<dyn Optimizer>,
    ) -> DbResult<Self> {
        config.validate()?;
        let inner = DbInner {
            locks: CollectionLocks::new(Arc::clone(&store), config.lock_lease()),
            stream: ChangeStream::new(config.change_stream_capacity, config.overflow_policy),
            schemas: SchemaRegistry::new(),
            hooks: HookRegistry::new(),
            optimizer,
            store,
            config,
            closed: AtomicBool::new(false),
        };
        let db = Self {
            inner: Arc::new(inner),
        };
        let loaded = db.load_schemas()?;
        db.inner.schemas.insert(cdc_schema());
        info!(target: "docudb::db", collections = loaded, "database opened");
        Ok(db)
    }

    /// Fresh database over an in-memory store with the default configuration
    pub fn in_memory() -> DbResult<Self> {
        Self::open(Arc::new(MemoryKv::new()), DbConfig::default())
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    /// Releases locks, ends every change subscription and closes the store
    pub fn close(&self) -> DbResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let unlocked = self.inner.locks.unlock_all();
        self.inner.stream.close();
        self.inner.hooks.clear();
        self.inner.schemas.clear();
        self.inner.store.close()?;
        info!(target: "docudb::db", "database closed");
        unlocked
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // ==================
    // Schemas
    // ==================

    /// Registers or changes a collection.
    ///
    /// Index changes lock the collection, clear the affected index
    /// prefixes and rebuild new or changed indexes from the primary index.
    pub fn configure_collection(&self, ctx: &Context, schema: CollectionSchema) -> DbResult<()> {
        self.ensure_open()?;
        let schema = schema.normalized();
        schema.validate_structure()?;
        if schema.collection == CDC_COLLECTION && !ctx.is_internal() {
            return Err(DbError::forbidden(format!(
                "collection {} is reserved",
                CDC_COLLECTION
            )));
        }

        let name = schema.collection.clone();
        let previous = self.inner.schemas.find(&name);
        let plan = IndexPlan::between(previous.as_deref(), &schema);
        if plan.is_empty() {
            self.inner
                .store
                .tx(TxOptions::read_write(), |tx| persist_schema(tx, &schema))?;
            self.inner.schemas.insert(schema);
            info!(target: "docudb::db", collection = %name, "collection configured");
            return Ok(());
        }

        if !self.inner.locks.try_lock(&name)? {
            return Err(DbError::CollectionLocked(name));
        }
        let result = self.migrate(ctx, previous.as_deref(), schema, &plan);
        let unlocked = self.inner.locks.unlock(&name);
        result?;
        unlocked?;
        info!(
            target: "docudb::db",
            collection = %name,
            rebuilt = plan.rebuild.len(),
            dropped = plan.drop.len(),
            "collection configured"
        );
        Ok(())
    }

    /// Clears and rebuilds every secondary index of a collection.
    ///
    /// Returns the number of documents indexed.
    pub fn reindex_collection(&self, ctx: &Context, collection: &str) -> DbResult<usize> {
        self.ensure_open()?;
        let schema = self.inner.schemas.get(collection)?;
        if !self.inner.locks.try_lock(collection)? {
            return Err(DbError::CollectionLocked(collection.to_string()));
        }
        let indexes: Vec<Index> = schema.secondary_indexes().cloned().collect();
        let result = self.rebuild(ctx, &schema, &indexes, &indexes);
        let unlocked = self.inner.locks.unlock(collection);
        let documents = result?;
        unlocked?;
        info!(
            target: "docudb::db",
            collection = %collection,
            indexes = indexes.len(),
            documents,
            "collection reindexed"
        );
        Ok(documents)
    }

    /// Registered collection names, sorted
    pub fn collections(&self) -> Vec<String> {
        self.inner.schemas.names()
    }

    pub fn get_schema(&self, collection: &str) -> DbResult<Arc<CollectionSchema>> {
        self.inner.schemas.get(collection)
    }

    pub fn has_collection(&self, collection: &str) -> bool {
        self.inner.schemas.contains(collection)
    }

    /// Plan the optimizer picks for `query` without running it
    pub fn explain(&self, collection: &str, query: &Query) -> DbResult<Explain> {
        let schema = self.inner.schemas.get(collection)?;
        self.inner
            .optimizer
            .optimize(&schema, &query.filter, &query.order_by)
    }

    // ==================
    // Transactions
    // ==================

    pub fn begin(&self, ctx: &Context, opts: TxOptions) -> DbResult<Transaction> {
        self.ensure_open()?;
        let kv = self.inner.store.begin(opts)?;
        debug!(
            target: "docudb::tx",
            request_id = %ctx.request_id,
            read_only = opts.read_only,
            "transaction started"
        );
        Ok(Transaction::new(Arc::clone(&self.inner), ctx.clone(), kv))
    }

    /// Runs `f` in a transaction; commits on `Ok`, rolls back on `Err`
    pub fn tx<T, F>(&self, ctx: &Context, opts: TxOptions, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Transaction) -> DbResult<T>,
    {
        let mut tx = self.begin(ctx, opts)?;
        match f(&mut tx) {
            Ok(out) => {
                tx.commit()?;
                Ok(out)
            }
            Err(e) => {
                if tx.state() == crate::tx::TxState::Open {
                    tx.rollback()?;
                }
                Err(e)
            }
        }
    }

    // ==================
    // Documents
    // ==================

    /// Creates a document in its own transaction, returning its id
    pub fn create(&self, ctx: &Context, collection: &str, document: Document) -> DbResult<String> {
        self.tx(ctx, TxOptions::read_write(), |tx| tx.create(collection, document))
    }

    pub fn set(&self, ctx: &Context, collection: &str, document: Document) -> DbResult<String> {
        self.tx(ctx, TxOptions::read_write(), |tx| tx.set(collection, document))
    }

    pub fn update(&self, ctx: &Context, collection: &str, id: &str, partial: Document) -> DbResult<()> {
        self.tx(ctx, TxOptions::read_write(), |tx| tx.update(collection, id, partial))
    }

    pub fn delete(&self, ctx: &Context, collection: &str, id: &str) -> DbResult<()> {
        self.tx(ctx, TxOptions::read_write(), |tx| tx.delete(collection, id))
    }

    pub fn get(&self, ctx: &Context, collection: &str, id: &str) -> DbResult<Document> {
        self.tx(ctx, TxOptions::read_only(), |tx| tx.get(collection, id))
    }

    pub fn query(&self, ctx: &Context, collection: &str, query: &Query) -> DbResult<Page> {
        self.tx(ctx, TxOptions::read_only(), |tx| tx.query(collection, query))
    }

    /// Walks pages from `query.page` until a page comes back empty or
    /// `handler` returns `false`. Every page reads the same snapshot.
    pub fn query_paginate<F>(
        &self,
        ctx: &Context,
        collection: &str,
        query: &Query,
        mut handler: F,
    ) -> DbResult<()>
    where
        F: FnMut(&Page) -> DbResult<bool>,
    {
        let limit = match query.limit {
            0 => self.inner.config.default_limit,
            n => n,
        };
        self.tx(ctx, TxOptions::read_only(), |tx| {
            let mut next = query.clone().limit(limit);
            loop {
                ctx.check_cancelled()?;
                let page = tx.query(collection, &next)?;
                if page.is_empty() || !handler(&page)? || limit == 0 {
                    return Ok(());
                }
                next = next.page(page.next_page);
            }
        })
    }

    // ==================
    // Hooks & change streams
    // ==================

    pub fn register_authorizer<A: Authorizer + 'static>(&self, collection: &str, authorizer: A) {
        self.inner
            .hooks
            .register_authorizer(collection, Arc::new(authorizer));
    }

    /// Binds a trigger to `actions` of a collection; an empty list binds all
    pub fn register_trigger<T: Trigger + 'static>(
        &self,
        collection: &str,
        actions: &[Action],
        trigger: T,
    ) {
        self.inner
            .hooks
            .register_trigger(collection, actions, Arc::new(trigger));
    }

    /// Subscribes to committed changes of `collection` (`"*"` for all)
    pub fn subscribe(&self, collection: &str) -> ChangeSubscription {
        self.inner.stream.subscribe(collection)
    }

    /// Spawns a task calling `handler` for each committed change
    pub fn on_change<H>(&self, collection: &str, handler: H) -> DbResult<ChangeStreamTask>
    where
        H: FnMut(&str, &Cdc) + Send + 'static,
    {
        self.inner.stream.on_change(collection, handler)
    }

    // ==================
    // Internals
    // ==================

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::Storage(crate::kv::KvError::Closed));
        }
        Ok(())
    }

    fn load_schemas(&self) -> DbResult<usize> {
        let tx = self.inner.store.begin(TxOptions::read_only())?;
        let mut loaded = Vec::new();
        {
            let mut it = tx.new_iterator(IterOptions::prefix(internal_key(SCHEMA_KIND, "")))?;
            while it.valid() {
                let raw = std::str::from_utf8(it.value())
                    .map_err(|e| DbError::Encoding(e.to_string()))?;
                loaded.push(CollectionSchema::from_json(raw)?);
                it.next();
            }
        }
        tx.rollback();
        let count = loaded.len();
        for schema in loaded {
            debug!(target: "docudb::db", collection = %schema.collection, "schema loaded");
            self.inner.schemas.insert(schema);
        }
        Ok(count)
    }

    /// Swaps in `schema` and rebuilds its changed indexes; restores the
    /// previous schema and its indexes when the rebuild fails
    fn migrate(
        &self,
        ctx: &Context,
        previous: Option<&CollectionSchema>,
        schema: CollectionSchema,
        plan: &IndexPlan,
    ) -> DbResult<()> {
        self.inner.schemas.insert(schema.clone());
        let result = self
            .rebuild(ctx, &schema, &plan.drop, &plan.rebuild)
            .and_then(|_| {
                self.inner
                    .store
                    .tx(TxOptions::read_write(), |tx| persist_schema(tx, &schema))
            });
        let Err(e) = result else {
            return Ok(());
        };

        warn!(
            target: "docudb::db",
            collection = %schema.collection,
            error = %e,
            "index rebuild failed, restoring previous schema"
        );
        match previous {
            Some(previous) => {
                self.inner.schemas.insert(previous.clone());
                let restore = IndexPlan::between(Some(&schema), previous);
                self.rebuild(&Context::internal(), previous, &restore.drop, &restore.rebuild)?;
            }
            None => {
                self.inner.schemas.remove(&schema.collection);
                for index in &plan.rebuild {
                    self.inner.store.drop_prefix(&index.prefix(&schema.collection))?;
                }
            }
        }
        Err(e)
    }

    /// Clears the prefixes of `drop`, then rebuilds `rebuild` in one batch
    /// transaction. The collection must be locked by the caller.
    fn rebuild(
        &self,
        ctx: &Context,
        schema: &CollectionSchema,
        drop: &[Index],
        rebuild: &[Index],
    ) -> DbResult<usize> {
        let names: BTreeSet<&str> = drop.iter().map(|i| i.name.as_str()).collect();
        for name in names {
            let prefix = IndexKey::new(&schema.collection, name).prefix();
            self.inner.store.drop_prefix(&prefix)?;
        }
        if rebuild.is_empty() {
            return Ok(0);
        }
        let internal = ctx.clone().as_internal();
        self.inner.store.tx(TxOptions::batch(), |tx| {
            let mut documents = 0;
            for index in rebuild {
                documents = rebuild_index(&internal, tx, schema, index)?;
            }
            Ok(documents)
        })
    }
}

fn persist_schema(tx: &mut dyn KvTx, schema: &CollectionSchema) -> DbResult<()> {
    let raw = serde_json::to_vec(schema)?;
    tx.set(&internal_key(SCHEMA_KIND, &schema.collection), &raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn user_schema() -> CollectionSchema {
        CollectionSchema::new("user").with_index(Index::new("email_idx", ["email"]).unique())
    }

    #[test]
    fn test_index_plan() {
        let old = user_schema().with_index(Index::new("age_idx", ["age"]));
        let new = user_schema()
            .with_index(Index::new("age_idx", ["age", "name"]))
            .with_index(Index::new("name_idx", ["name"]));
        let plan = IndexPlan::between(Some(&old), &new);
        let rebuilt: Vec<&str> = plan.rebuild.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(rebuilt, vec!["age_idx", "name_idx"]);

        let plan = IndexPlan::between(Some(&new), &user_schema());
        assert!(plan.rebuild.is_empty());
        assert_eq!(plan.drop.len(), 2);

        assert!(IndexPlan::between(Some(&old), &old).is_empty());
    }

    #[test]
    fn test_cdc_collection_always_registered() {
        let db = Database::in_memory().unwrap();
        assert!(db.has_collection(CDC_COLLECTION));
        let err = db
            .configure_collection(&Context::new(), CollectionSchema::new(CDC_COLLECTION))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn test_schemas_persist_across_open() {
        let store = MemoryKv::new();
        let db = Database::open(Arc::new(store.clone()), DbConfig::default()).unwrap();
        db.configure_collection(&Context::new(), user_schema()).unwrap();

        let reopened = Database::open(Arc::new(store), DbConfig::default()).unwrap();
        let schema = reopened.get_schema("user").unwrap();
        assert!(schema.index("email_idx").is_some());
        assert_eq!(reopened.collections(), vec!["cdc".to_string(), "user".to_string()]);
    }

    #[test]
    fn test_configure_rebuilds_added_index() {
        let db = Database::in_memory().unwrap();
        let ctx = Context::new();
        db.configure_collection(&ctx, CollectionSchema::new("user")).unwrap();
        for (id, age) in [("1", 30), ("2", 20), ("3", 30)] {
            db.create(&ctx, "user", doc(json!({"_id": id, "age": age})))
                .unwrap();
        }

        db.configure_collection(
            &ctx,
            CollectionSchema::new("user").with_index(Index::new("age_idx", ["age"])),
        )
        .unwrap();
        let query = Query::new().with_where(crate::document::Where::eq("age", 30));
        let page = db.query(&ctx, "user", &query).unwrap();
        assert_eq!(page.stats.explain.index, "age_idx");
        assert_eq!(
            page.values("_id"),
            vec![Some(&json!("1")), Some(&json!("3"))]
        );
    }

    #[test]
    fn test_failed_rebuild_restores_schema() {
        let db = Database::in_memory().unwrap();
        let ctx = Context::new();
        db.configure_collection(&ctx, CollectionSchema::new("user")).unwrap();
        db.create(&ctx, "user", doc(json!({"_id": "1", "email": "a"}))).unwrap();
        db.create(&ctx, "user", doc(json!({"_id": "2", "email": "a"}))).unwrap();

        let err = db.configure_collection(&ctx, user_schema()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UniqueConstraintViolation);
        assert!(db.get_schema("user").unwrap().index("email_idx").is_none());
        assert!(!db.inner.locks.is_locked("user").unwrap());
    }

    #[test]
    fn test_tx_rolls_back_on_error() {
        let db = Database::in_memory().unwrap();
        let ctx = Context::new();
        db.configure_collection(&ctx, CollectionSchema::new("user")).unwrap();
        let result: DbResult<()> = db.tx(&ctx, TxOptions::read_write(), |tx| {
            tx.create("user", doc(json!({"_id": "1"})))?;
            Err(DbError::validation("abort"))
        });
        assert!(result.is_err());
        assert!(db.get(&ctx, "user", "1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_closed_database_rejects_work() {
        let db = Database::in_memory().unwrap();
        db.close().unwrap();
        assert!(db.begin(&Context::new(), TxOptions::read_only()).is_err());
        db.close().unwrap();
    }
}
