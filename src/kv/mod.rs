//! Key-value adapter
//!
//! The engine consumes an ordered byte store through these traits:
//! point reads and writes, prefix iteration in either direction, atomic
//! transactions, bulk prefix deletion and a leased advisory lock.
//!
//! Iteration contract:
//! - only keys starting with `prefix` are yielded
//! - forward iteration starts at the first key `>= seek`
//! - reverse iteration starts at the greatest key `< seek`
//! - without `seek`, iteration covers the whole prefix

mod errors;
mod locker;
mod memory;

use std::time::Duration;

pub use errors::{KvError, KvResult};
pub use locker::{LeaseLocker, LockMeta};
pub use memory::MemoryKv;

/// Transaction options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// Reject writes
    pub read_only: bool,
    /// Hint that the transaction carries a large number of writes
    pub batch: bool,
}

impl TxOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            batch: false,
        }
    }

    pub fn read_write() -> Self {
        Self::default()
    }

    pub fn batch() -> Self {
        Self {
            read_only: false,
            batch: true,
        }
    }
}

/// Iterator options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterOptions {
    pub prefix: Vec<u8>,
    pub seek: Option<Vec<u8>>,
    pub reverse: bool,
}

impl IterOptions {
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn seek(mut self, seek: impl Into<Vec<u8>>) -> Self {
        self.seek = Some(seek.into());
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }
}

/// Cursor over a key range
pub trait KvIterator {
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn next(&mut self);
}

/// An open transaction; dropping it without commit rolls it back
pub trait KvTx: Send {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>>;
    fn set(&mut self, key: &[u8], value: &[u8]) -> KvResult<()>;
    fn delete(&mut self, key: &[u8]) -> KvResult<()>;
    fn new_iterator(&self, opts: IterOptions) -> KvResult<Box<dyn KvIterator + '_>>;
    fn is_read_only(&self) -> bool;
    fn commit(self: Box<Self>) -> KvResult<()>;
    fn rollback(self: Box<Self>);
}

/// Ordered transactional byte store
pub trait KvStore: Send + Sync {
    fn begin(&self, opts: TxOptions) -> KvResult<Box<dyn KvTx>>;

    /// Deletes every key starting with `prefix`
    fn drop_prefix(&self, prefix: &[u8]) -> KvResult<()>;

    /// Creates a leased lock on `key`; nothing is acquired until `try_lock`
    fn new_locker(&self, key: &[u8], lease: Duration) -> Box<dyn Locker>;

    fn close(&self) -> KvResult<()>;
}

/// Runs `f` inside a transaction; commits on `Ok`, rolls back on `Err`.
pub trait KvStoreExt {
    fn tx<T, E, F>(&self, opts: TxOptions, f: F) -> Result<T, E>
    where
        E: From<KvError>,
        F: FnOnce(&mut dyn KvTx) -> Result<T, E>;
}

impl<S: KvStore + ?Sized> KvStoreExt for S {
    fn tx<T, E, F>(&self, opts: TxOptions, f: F) -> Result<T, E>
    where
        E: From<KvError>,
        F: FnOnce(&mut dyn KvTx) -> Result<T, E>,
    {
        let mut tx = self.begin(opts)?;
        match f(tx.as_mut()) {
            Ok(out) => {
                tx.commit()?;
                Ok(out)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }
}

/// Advisory lock with a renewed lease
pub trait Locker: Send {
    /// Acquires the lock if free or stale; never blocks
    fn try_lock(&mut self) -> KvResult<bool>;

    /// Whether the lock is held by this locker or by a live holder
    fn is_locked(&self) -> KvResult<bool>;

    /// Releases the lock and stops the keepalive, returning its first error
    fn unlock(&mut self) -> KvResult<()>;
}
