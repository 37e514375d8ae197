//! Leased advisory lock stored as a key in the store itself
//!
//! The holder renews `last_update` once per lease from a keepalive thread.
//! A lock whose `last_update` is older than four leases is stale and may be
//! taken over by another locker.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{KvError, KvResult, KvStore, KvStoreExt, KvTx, Locker, TxOptions};

/// Number of lease intervals after which an unrenewed lock is stale
pub const STALE_AFTER_LEASES: i64 = 4;

/// Persisted lock state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMeta {
    pub id: String,
    pub key: String,
    pub start: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl LockMeta {
    /// Whether the holder stopped renewing
    pub fn is_stale(&self, lease: Duration, now: DateTime<Utc>) -> bool {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        (now - self.last_update).num_milliseconds() > lease_ms.saturating_mul(STALE_AFTER_LEASES)
    }
}

struct Keepalive {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<KvResult<()>>,
}

/// Lock over any [`KvStore`]
pub struct LeaseLocker<S: KvStore + Clone + 'static> {
    store: S,
    key: Vec<u8>,
    id: String,
    lease: Duration,
    keepalive: Option<Keepalive>,
}

impl<S: KvStore + Clone + 'static> LeaseLocker<S> {
    pub fn new(store: S, key: &[u8], lease: Duration) -> Self {
        Self {
            store,
            key: key.to_vec(),
            id: Uuid::new_v4().to_string(),
            lease,
            keepalive: None,
        }
    }

    /// Unique id of this locker
    pub fn id(&self) -> &str {
        &self.id
    }

    fn spawn_keepalive(&mut self) -> KvResult<()> {
        let (stop, stopped) = mpsc::channel::<()>();
        let store = self.store.clone();
        let key = self.key.clone();
        let id = self.id.clone();
        let lease = self.lease;

        let handle = std::thread::Builder::new()
            .name("docudb-lock-keepalive".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(lease) {
                    Err(RecvTimeoutError::Timeout) => renew(&store, &key, &id)?,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        return release(&store, &key, &id);
                    }
                }
            })
            .map_err(|e| KvError::Lock(format!("failed to spawn keepalive: {}", e)))?;

        self.keepalive = Some(Keepalive { stop, handle });
        Ok(())
    }
}

impl<S: KvStore + Clone + 'static> Locker for LeaseLocker<S> {
    fn try_lock(&mut self) -> KvResult<bool> {
        if self.keepalive.is_some() {
            return Ok(true);
        }
        let key_name = String::from_utf8_lossy(&self.key).into_owned();
        let acquired = self.store.tx(TxOptions::read_write(), |tx| -> KvResult<bool> {
            let now = Utc::now();
            if let Some(current) = read_meta(tx, &self.key)? {
                if current.id != self.id {
                    if !current.is_stale(self.lease, now) {
                        return Ok(false);
                    }
                    warn!(
                        target: "docudb::lock",
                        key = %key_name,
                        holder = %current.id,
                        "Taking over stale lock"
                    );
                }
            }
            let meta = LockMeta {
                id: self.id.clone(),
                key: key_name.clone(),
                start: now,
                last_update: now,
            };
            write_meta(tx, &self.key, &meta)?;
            Ok(true)
        })?;

        if acquired {
            self.spawn_keepalive()?;
            debug!(target: "docudb::lock", key = %key_name, id = %self.id, "Lock acquired");
        }
        Ok(acquired)
    }

    fn is_locked(&self) -> KvResult<bool> {
        let tx = self.store.begin(TxOptions::read_only())?;
        Ok(match read_meta(tx.as_ref(), &self.key)? {
            Some(meta) => meta.id == self.id || !meta.is_stale(self.lease, Utc::now()),
            None => false,
        })
    }

    fn unlock(&mut self) -> KvResult<()> {
        let Some(keepalive) = self.keepalive.take() else {
            return Ok(());
        };
        // the thread may already have exited with an error
        let _ = keepalive.stop.send(());
        let result = keepalive
            .handle
            .join()
            .map_err(|_| KvError::Lock("keepalive thread panicked".to_string()))?;
        debug!(
            target: "docudb::lock",
            key = %String::from_utf8_lossy(&self.key),
            id = %self.id,
            "Lock released"
        );
        result
    }
}

impl<S: KvStore + Clone + 'static> Drop for LeaseLocker<S> {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!(target: "docudb::lock", error = %e, "Failed to release lock on drop");
        }
    }
}

fn read_meta(tx: &dyn KvTx, key: &[u8]) -> KvResult<Option<LockMeta>> {
    match tx.get(key)? {
        Some(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| KvError::Lock(format!("corrupt lock metadata: {}", e))),
        None => Ok(None),
    }
}

fn write_meta(tx: &mut dyn KvTx, key: &[u8], meta: &LockMeta) -> KvResult<()> {
    let raw = serde_json::to_vec(meta).map_err(|e| KvError::Lock(e.to_string()))?;
    tx.set(key, &raw)
}

fn renew<S: KvStore>(store: &S, key: &[u8], id: &str) -> KvResult<()> {
    store.tx(TxOptions::read_write(), |tx| match read_meta(tx, key)? {
        Some(mut meta) if meta.id == id => {
            meta.last_update = Utc::now();
            write_meta(tx, key, &meta)
        }
        _ => Err(KvError::Lock(format!(
            "lock {} lost by {}",
            String::from_utf8_lossy(key),
            id
        ))),
    })
}

fn release<S: KvStore>(store: &S, key: &[u8], id: &str) -> KvResult<()> {
    store.tx(TxOptions::read_write(), |tx| match read_meta(tx, key)? {
        Some(meta) if meta.id == id => tx.delete(key),
        _ => Ok(()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    const LEASE: Duration = Duration::from_millis(20);

    #[test]
    fn test_exclusive_until_unlocked() {
        let store = MemoryKv::new();
        let mut first = store.new_locker(b"lock/a", LEASE);
        let mut second = store.new_locker(b"lock/a", LEASE);

        assert!(first.try_lock().unwrap());
        assert!(first.try_lock().unwrap());
        assert!(!second.try_lock().unwrap());
        assert!(second.is_locked().unwrap());

        first.unlock().unwrap();
        assert!(!second.is_locked().unwrap());
        assert!(second.try_lock().unwrap());
        second.unlock().unwrap();
    }

    #[test]
    fn test_keepalive_prevents_staleness() {
        let store = MemoryKv::new();
        let mut holder = store.new_locker(b"lock/b", LEASE);
        assert!(holder.try_lock().unwrap());

        std::thread::sleep(LEASE * 8);
        let mut other = store.new_locker(b"lock/b", LEASE);
        assert!(!other.try_lock().unwrap());
        holder.unlock().unwrap();
    }

    #[test]
    fn test_stale_lock_is_reacquirable() {
        let store = MemoryKv::new();
        let old = Utc::now() - chrono::Duration::seconds(60);
        let meta = LockMeta {
            id: "crashed".to_string(),
            key: "lock/c".to_string(),
            start: old,
            last_update: old,
        };
        store
            .tx(TxOptions::read_write(), |tx| write_meta(tx, b"lock/c", &meta))
            .unwrap();

        let mut locker = store.new_locker(b"lock/c", LEASE);
        assert!(!locker.is_locked().unwrap());
        assert!(locker.try_lock().unwrap());
        locker.unlock().unwrap();
    }

    #[test]
    fn test_drop_releases() {
        let store = MemoryKv::new();
        {
            let mut locker = store.new_locker(b"lock/d", LEASE);
            assert!(locker.try_lock().unwrap());
        }
        let mut other = store.new_locker(b"lock/d", LEASE);
        assert!(other.try_lock().unwrap());
    }
}
