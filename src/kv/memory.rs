//! In-memory ordered store
//!
//! Committed state is an `Arc<BTreeMap>` behind a `RwLock`. Every
//! transaction captures the current map when it begins and reads only from
//! it, so a reader keeps a stable snapshot while writers commit. Commits are
//! copy-on-write: the map is cloned only while a snapshot is still shared.
//! Write transactions buffer their changes and hold the single writer slot
//! until they finish, so write transactions are serialized.

use std::cmp::Ordering as KeyOrder;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::trace;

use super::{IterOptions, KvError, KvIterator, KvResult, KvStore, KvTx, Locker, TxOptions};
use super::locker::LeaseLocker;
use crate::index::next_prefix;

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type Entries = BTreeMap<Vec<u8>, Vec<u8>>;

// `None` marks a buffered delete
type Buffer = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Shared in-memory store; clones share the same data
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    data: RwLock<Arc<Entries>>,
    gate: Arc<WriterGate>,
    write_timeout: Duration,
    closed: AtomicBool,
}

impl MemoryInner {
    fn snapshot(&self) -> Arc<Entries> {
        Arc::clone(&self.data.read())
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }

    /// How long a write transaction waits for the writer slot before
    /// failing with [`KvError::Busy`]
    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                data: RwLock::new(Arc::new(BTreeMap::new())),
                gate: Arc::new(WriterGate::default()),
                write_timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of committed keys
    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> KvResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(KvError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKv {
    fn begin(&self, opts: TxOptions) -> KvResult<Box<dyn KvTx>> {
        self.check_open()?;
        // the writer slot is taken first so a writer's snapshot is the latest commit
        let permit = if opts.read_only {
            None
        } else {
            Some(self.inner.gate.acquire(self.inner.write_timeout)?)
        };
        Ok(Box::new(MemoryTx {
            store: Arc::clone(&self.inner),
            snapshot: self.inner.snapshot(),
            read_only: opts.read_only,
            writes: BTreeMap::new(),
            _permit: permit,
        }))
    }

    fn drop_prefix(&self, prefix: &[u8]) -> KvResult<()> {
        self.check_open()?;
        let _permit = self.inner.gate.acquire(self.inner.write_timeout)?;
        let mut data = self.inner.data.write();
        let entries = Arc::make_mut(&mut *data);
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        trace!(target: "docudb::kv", removed = before - entries.len(), "Dropped prefix");
        Ok(())
    }

    fn new_locker(&self, key: &[u8], lease: Duration) -> Box<dyn Locker> {
        Box::new(LeaseLocker::new(self.clone(), key, lease))
    }

    fn close(&self) -> KvResult<()> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MemoryTx {
    store: Arc<MemoryInner>,
    snapshot: Arc<Entries>,
    read_only: bool,
    writes: Buffer,
    _permit: Option<WriterPermit>,
}

impl MemoryTx {
    fn check_writable(&self) -> KvResult<()> {
        if self.read_only {
            return Err(KvError::ReadOnly);
        }
        if self.store.closed.load(Ordering::Acquire) {
            return Err(KvError::Closed);
        }
        Ok(())
    }
}

impl KvTx for MemoryTx {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        Ok(self.snapshot.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.check_writable()?;
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> KvResult<()> {
        self.check_writable()?;
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn new_iterator(&self, opts: IterOptions) -> KvResult<Box<dyn KvIterator + '_>> {
        let seek = opts.seek.filter(|s| !s.is_empty());
        let prefix_end = next_prefix(&opts.prefix);

        let lower: Vec<u8> = match (&seek, opts.reverse) {
            (Some(seek), false) if seek.as_slice() > opts.prefix.as_slice() => seek.clone(),
            _ => opts.prefix.clone(),
        };
        let upper: Option<Vec<u8>> = match (&seek, opts.reverse) {
            (Some(seek), true) if prefix_end.is_empty() || seek < &prefix_end => Some(seek.clone()),
            _ => (!prefix_end.is_empty()).then_some(prefix_end),
        };
        if upper.as_ref().is_some_and(|upper| lower >= *upper) {
            return Ok(Box::new(MemoryIterator::new(
                Box::new(std::iter::empty()),
                Box::new(std::iter::empty()),
                opts.prefix,
                opts.reverse,
            )));
        }
        let range = (
            Bound::Included(lower.as_slice()),
            match &upper {
                Some(upper) => Bound::Excluded(upper.as_slice()),
                None => Bound::Unbounded,
            },
        );

        let committed = self.snapshot.range::<[u8], _>(range);
        let buffered = self.writes.range::<[u8], _>(range);
        let committed: Committed<'_> = if opts.reverse {
            Box::new(committed.rev())
        } else {
            Box::new(committed)
        };
        let buffered: Buffered<'_> = if opts.reverse {
            Box::new(buffered.rev())
        } else {
            Box::new(buffered)
        };
        Ok(Box::new(MemoryIterator::new(
            committed,
            buffered,
            opts.prefix,
            opts.reverse,
        )))
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn commit(self: Box<Self>) -> KvResult<()> {
        let MemoryTx {
            store,
            snapshot,
            writes,
            _permit,
            ..
        } = *self;
        // release our reference so an unshared map is updated in place
        drop(snapshot);
        if writes.is_empty() {
            return Ok(());
        }
        if store.closed.load(Ordering::Acquire) {
            return Err(KvError::Closed);
        }
        let mut data = store.data.write();
        let entries = Arc::make_mut(&mut *data);
        let count = writes.len();
        for (key, value) in writes {
            match value {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        trace!(target: "docudb::kv", writes = count, "Committed");
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}

type Committed<'a> = Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a>;
type Buffered<'a> = Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)> + 'a>;

/// Lazy merge of the snapshot range with the transaction's buffered writes
struct MemoryIterator<'a> {
    committed: Peekable<Committed<'a>>,
    buffered: Peekable<Buffered<'a>>,
    prefix: Vec<u8>,
    reverse: bool,
    current: Option<(&'a [u8], &'a [u8])>,
}

impl<'a> MemoryIterator<'a> {
    fn new(committed: Committed<'a>, buffered: Buffered<'a>, prefix: Vec<u8>, reverse: bool) -> Self {
        let mut it = Self {
            committed: committed.peekable(),
            buffered: buffered.peekable(),
            prefix,
            reverse,
            current: None,
        };
        it.advance();
        it
    }

    fn advance(&mut self) {
        self.current = loop {
            let committed = self.committed.peek().map(|&(k, _)| k.as_slice());
            let buffered = self.buffered.peek().map(|&(k, _)| k.as_slice());
            let from_committed = match (committed, buffered) {
                (None, None) => break None,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(c), Some(b)) => {
                    let order = if self.reverse { b.cmp(c) } else { c.cmp(b) };
                    match order {
                        KeyOrder::Less => true,
                        KeyOrder::Greater => false,
                        KeyOrder::Equal => {
                            // the buffered write shadows the committed entry
                            self.committed.next();
                            false
                        }
                    }
                }
            };
            if from_committed {
                match self.committed.next() {
                    Some((k, v)) => break Some((k.as_slice(), v.as_slice())),
                    None => break None,
                }
            }
            match self.buffered.next() {
                Some((k, Some(v))) => break Some((k.as_slice(), v.as_slice())),
                Some((_, None)) => continue,
                None => break None,
            }
        };
        if self
            .current
            .is_some_and(|(key, _)| !key.starts_with(&self.prefix))
        {
            self.current = None;
        }
    }
}

impl KvIterator for MemoryIterator<'_> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.map(|(k, _)| k).unwrap_or_default()
    }

    fn value(&self) -> &[u8] {
        self.current.map(|(_, v)| v).unwrap_or_default()
    }

    fn next(&mut self) {
        self.advance();
    }
}

/// Single writer slot
#[derive(Default)]
struct WriterGate {
    busy: Mutex<bool>,
    released: Condvar,
}

impl WriterGate {
    fn acquire(self: &Arc<Self>, timeout: Duration) -> KvResult<WriterPermit> {
        let deadline = Instant::now() + timeout;
        let mut busy = self.busy.lock();
        while *busy {
            if self.released.wait_until(&mut busy, deadline).timed_out() && *busy {
                return Err(KvError::Busy);
            }
        }
        *busy = true;
        Ok(WriterPermit {
            gate: Arc::clone(self),
        })
    }
}

struct WriterPermit {
    gate: Arc<WriterGate>,
}

impl Drop for WriterPermit {
    fn drop(&mut self) {
        *self.gate.busy.lock() = false;
        self.gate.released.notify_one();
    }
}
