//! Index subsystem
//!
//! Indexes live in the KV store next to the documents they cover, under
//! keys produced by the order-preserving codec.
//!
//! # Invariants
//!
//! - Every document has exactly one primary entry holding its bytes
//! - Every secondary index holds exactly one entry per document
//! - Secondary entries are updated in the same transaction as the primary

mod codec;
mod maintenance;

pub use codec::{
    decode_value, encode_key, encode_value, internal_key, next_prefix, IndexKey, INDEX_NAMESPACE,
    INTERNAL_NAMESPACE, SEPARATOR,
};
pub use maintenance::{
    check_foreign_key, check_unique, delete_primary, entry_document_id, get_document,
    put_primary, rebuild_index, referencing_ids, scan_collection, update_secondary,
};
