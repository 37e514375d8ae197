//! Collection lock manager

mod manager;

pub use manager::{CollectionLocks, LOCK_KIND};
