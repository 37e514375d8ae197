//! Per-collection advisory locks
//!
//! A collection is locked while its indexes are being rebuilt. The lock
//! lives in the store, so every handle opened on the same store observes
//! it; locks taken through this manager are also tracked locally so they
//! can be released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::index::internal_key;
use crate::kv::{KvStore, Locker};

/// Namespace of lock keys under the internal prefix
pub const LOCK_KIND: &str = "lock";

pub struct CollectionLocks {
    store: Arc<dyn KvStore>,
    lease: Duration,
    held: Mutex<HashMap<String, Box<dyn Locker>>>,
}

impl CollectionLocks {
    pub fn new(store: Arc<dyn KvStore>, lease: Duration) -> Self {
        Self {
            store,
            lease,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Key the lock metadata is stored under
    pub fn lock_key(collection: &str) -> Vec<u8> {
        internal_key(LOCK_KIND, collection)
    }

    /// Tries to lock `collection`; never blocks.
    ///
    /// Returns `false` when the lock is held elsewhere, including by an
    /// earlier call on this manager.
    pub fn try_lock(&self, collection: &str) -> DbResult<bool> {
        let mut held = self.held.lock();
        if held.contains_key(collection) {
            return Ok(false);
        }
        let mut locker = self.store.new_locker(&Self::lock_key(collection), self.lease);
        if !locker.try_lock()? {
            debug!(target: "docudb::lock", collection = %collection, "collection lock busy");
            return Ok(false);
        }
        held.insert(collection.to_string(), locker);
        info!(target: "docudb::lock", collection = %collection, "collection locked");
        Ok(true)
    }

    /// Releases a lock taken by this manager; a no-op otherwise
    pub fn unlock(&self, collection: &str) -> DbResult<()> {
        let locker = self.held.lock().remove(collection);
        if let Some(mut locker) = locker {
            locker.unlock()?;
            info!(target: "docudb::lock", collection = %collection, "collection unlocked");
        }
        Ok(())
    }

    /// Whether any live holder has the collection locked
    pub fn is_locked(&self, collection: &str) -> DbResult<bool> {
        if self.held.lock().contains_key(collection) {
            return Ok(true);
        }
        let probe = self.store.new_locker(&Self::lock_key(collection), self.lease);
        Ok(probe.is_locked()?)
    }

    /// Fails with `CollectionLocked` while the collection is locked
    pub fn ensure_unlocked(&self, collection: &str) -> DbResult<()> {
        if self.is_locked(collection)? {
            return Err(DbError::CollectionLocked(collection.to_string()));
        }
        Ok(())
    }

    /// Releases every lock held by this manager, returning the first error
    pub fn unlock_all(&self) -> DbResult<()> {
        let held: Vec<(String, Box<dyn Locker>)> = self.held.lock().drain().collect();
        let mut first_error = None;
        for (collection, mut locker) in held {
            if let Err(e) = locker.unlock() {
                first_error.get_or_insert(DbError::from(e));
            } else {
                debug!(target: "docudb::lock", collection = %collection, "collection unlocked");
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for CollectionLocks {
    fn drop(&mut self) {
        let _ = self.unlock_all();
    }
}
