//! docudb - an embeddable JSON document database over an ordered key-value store
//!
//! Documents live in collections described by a [`CollectionSchema`]. Every
//! collection has a primary index and any number of secondary indexes,
//! optionally unique or carrying a foreign key. Indexes are kept consistent
//! inside the same KV transaction as the document write.
//!
//! ```no_run
//! use docudb::{CollectionSchema, Context, Database, Document, Index, Query, Where};
//! use serde_json::json;
//!
//! # fn main() -> docudb::DbResult<()> {
//! let db = Database::in_memory()?;
//! let ctx = Context::new();
//! db.configure_collection(
//!     &ctx,
//!     CollectionSchema::new("user").with_index(Index::new("email_idx", ["email"]).unique()),
//! )?;
//! db.create(&ctx, "user", Document::from_value(json!({"email": "a@example.com"}))?)?;
//! let page = db.query(&ctx, "user", &Query::new().with_where(Where::eq("email", "a@example.com")))?;
//! assert_eq!(page.count, 1);
//! # Ok(())
//! # }
//! ```

pub mod cdc;
pub mod config;
pub mod context;
pub mod db;
pub mod document;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod index;
pub mod kv;
pub mod lock;
pub mod planner;
pub mod schema;
pub mod tx;

pub use cdc::{Cdc, ChangeStreamTask, ChangeSubscription, OverflowPolicy, CDC_COLLECTION};
pub use config::DbConfig;
pub use context::{CancelToken, Context};
pub use db::Database;
pub use document::{Document, FieldChange, PatchOp, Where, WhereOp};
pub use error::{DbError, DbResult, ErrorKind};
pub use executor::Page;
pub use hooks::{Authorizer, Trigger};
pub use kv::{KvStore, MemoryKv, TxOptions};
pub use planner::{
    AggregateFunction, Explain, Join, Optimizer, OrderBy, Query, Select, SortDirection,
};
pub use schema::{CollectionSchema, FieldDef, FieldType, ForeignKey, Index};
pub use tx::{Action, Command, Transaction, TxState};
