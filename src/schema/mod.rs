//! Collection schemas
//!
//! Schemas are plain serde structures: they can be built in code or parsed
//! from JSON. The registry is shared by every transaction of a database.

mod registry;
mod types;
mod validator;

pub use registry::SchemaRegistry;
pub use types::{
    CollectionSchema, FieldDef, FieldType, ForeignKey, Index, DEFAULT_PRIMARY_KEY,
    PRIMARY_INDEX_NAME,
};
pub use validator::SchemaValidator;
