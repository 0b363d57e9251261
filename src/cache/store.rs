//! Durable key → [`CacheEntry`] storage.
//!
//! [`CacheStore`] layers entry encoding, corruption handling and counters on
//! top of any [`KvEngine`]. Each operation is an independent atomic step on a
//! single key; nothing here spans keys or holds locks across calls.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::key::CacheKey;

/// Errors surfaced by the store and its engines.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage engine error: {0}")]
    Engine(#[from] sled::Error),

    #[error("in-memory engine lock poisoned")]
    Poisoned,

    #[error("failed to encode cache entry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("corrupt cache record {key:?}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// A raw key/value record as held by an engine.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// The minimal capability a persistent engine must offer.
///
/// Every method is atomic for a single key. `scan` is a one-shot traversal of
/// whatever the engine holds when it is called.
pub trait KvEngine: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Writes `value`, replacing any previous value.
    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;

    /// Removes `key`. Removing an absent key succeeds.
    fn remove(&self, key: &[u8]) -> Result<(), StoreError>;

    fn scan(&self) -> Box<dyn Iterator<Item = Result<KvPair, StoreError>> + '_>;

    /// Forces buffered writes to durable storage.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// [`KvEngine`] backed by an embedded `sled` database.
#[derive(Debug, Clone)]
pub struct SledEngine {
    db: sled::Db,
}

impl SledEngine {
    /// Opens (or creates) the database directory at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Opens a throwaway database that is removed when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl KvEngine for SledEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db.remove(key)?;
        Ok(())
    }

    fn scan(&self) -> Box<dyn Iterator<Item = Result<KvPair, StoreError>> + '_> {
        Box::new(
            self.db
                .iter()
                .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(StoreError::from)),
        )
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Volatile [`KvEngine`]; contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvEngine for MemoryEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.map.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(key).cloned())
    }

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        let mut map = self.map.write().map_err(|_| StoreError::Poisoned)?;
        map.insert(key.to_vec(), value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut map = self.map.write().map_err(|_| StoreError::Poisoned)?;
        map.remove(key);
        Ok(())
    }

    fn scan(&self) -> Box<dyn Iterator<Item = Result<KvPair, StoreError>> + '_> {
        // Snapshot so the read lock is not held while the caller deletes.
        match self.map.read() {
            Ok(map) => {
                let snapshot: Vec<KvPair> =
                    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                Box::new(snapshot.into_iter().map(Ok))
            }
            Err(_) => Box::new(std::iter::once(Err(StoreError::Poisoned))),
        }
    }
}

/// Running totals for store traffic.
#[derive(Debug, Default)]
pub struct StoreStats {
    reads: AtomicU64,
    absent: AtomicU64,
    corrupt: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatsSnapshot {
    pub reads: u64,
    /// Reads that found no record at all.
    pub absent: u64,
    /// Reads that found a record which failed to decode.
    pub corrupt: u64,
    pub writes: u64,
    pub deletes: u64,
}

impl StoreStats {
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            absent: self.absent.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Cache entry storage shared by the proxy and the expiry sweeper.
///
/// Cloning is cheap; clones share the same engine and counters.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
/// use std::time::{Duration, SystemTime};
/// use cachegate::cache::{CacheEntry, CacheStore, derive_key};
///
/// let store = CacheStore::in_memory();
/// let key = derive_key("/assets/app.js");
/// let entry = CacheEntry::new("js", BTreeMap::new(), SystemTime::now(), Duration::from_secs(60));
///
/// store.set(&key, &entry).unwrap();
/// assert_eq!(store.get(&key).unwrap(), Some(entry));
/// store.delete(&key).unwrap();
/// assert_eq!(store.get(&key).unwrap(), None);
/// ```
#[derive(Clone)]
pub struct CacheStore {
    engine: Arc<dyn KvEngine>,
    stats: Arc<StoreStats>,
}

impl CacheStore {
    pub fn new(engine: impl KvEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            stats: Arc::default(),
        }
    }

    /// Opens a `sled`-backed store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(SledEngine::open(path)?))
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryEngine::new())
    }

    /// Encodes `entry` and writes it under `key`, replacing any prior value.
    pub fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), StoreError> {
        let encoded = entry.encode().map_err(StoreError::Encode)?;
        self.engine.insert(key.as_bytes(), encoded)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        debug!(%key, "cache entry stored");
        Ok(())
    }

    /// Reads the entry stored under `key`.
    ///
    /// A record that fails to decode is reported as absent (and counted as
    /// corrupt). Expiry is not checked here.
    ///
    /// # Errors
    ///
    /// Only engine failures are returned.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let Some(raw) = self.engine.get(key.as_bytes())? else {
            self.stats.absent.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        match CacheEntry::decode(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                self.stats.corrupt.fetch_add(1, Ordering::Relaxed);
                warn!(%key, error = %e, "corrupt cache record treated as miss");
                Ok(None)
            }
        }
    }

    /// Removes `key`. Deleting an absent key is not an error.
    pub fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.engine.remove(key.as_bytes())?;
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        debug!(%key, "cache entry deleted");
        Ok(())
    }

    /// Walks every record once, in engine order.
    ///
    /// Records with a malformed key or undecodable value are yielded as
    /// [`StoreError::Corrupt`] so a caller can skip them and keep going.
    pub fn scan_all(&self) -> impl Iterator<Item = Result<(CacheKey, CacheEntry), StoreError>> + '_ {
        self.engine.scan().map(|item| {
            let (raw_key, raw_value) = item?;
            let key = CacheKey::from_stored(&raw_key).ok_or_else(|| StoreError::Corrupt {
                key: String::from_utf8_lossy(&raw_key).into_owned(),
                reason: "malformed key".to_owned(),
            })?;
            let entry = CacheEntry::decode(&raw_value).map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
            Ok((key, entry))
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.engine.flush()
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    /// Writes raw bytes under `key`, bypassing encoding.
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.engine.insert(key, value.to_vec())
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::cache::key::derive_key;

    fn entry(body: &str, ttl_secs: u64) -> CacheEntry {
        let headers = BTreeMap::from([("content-type".to_owned(), "text/plain".to_owned())]);
        CacheEntry::new(body, headers, SystemTime::now(), Duration::from_secs(ttl_secs))
    }

    fn stores() -> Vec<CacheStore> {
        vec![
            CacheStore::in_memory(),
            CacheStore::new(SledEngine::temporary().unwrap()),
        ]
    }

    #[test]
    fn set_then_get_returns_exact_entry() {
        for store in stores() {
            let key = derive_key("/a");
            let e = entry("hello", 5);
            store.set(&key, &e).unwrap();
            assert_eq!(store.get(&key).unwrap(), Some(e));
        }
    }

    #[test]
    fn overwrite_replaces_previous_value() {
        for store in stores() {
            let key = derive_key("/a");
            store.set(&key, &entry("old", 5)).unwrap();
            let newer = entry("new", 5);
            store.set(&key, &newer).unwrap();
            assert_eq!(store.get(&key).unwrap(), Some(newer));
        }
    }

    #[test]
    fn missing_key_is_none() {
        for store in stores() {
            assert_eq!(store.get(&derive_key("/nothing")).unwrap(), None);
            assert_eq!(store.stats().absent, 1);
        }
    }

    #[test]
    fn delete_is_idempotent() {
        for store in stores() {
            let key = derive_key("/a");
            store.set(&key, &entry("x", 5)).unwrap();
            store.delete(&key).unwrap();
            store.delete(&key).unwrap();
            assert_eq!(store.get(&key).unwrap(), None);
        }
    }

    #[test]
    fn corrupt_record_reads_as_miss_and_is_counted() {
        for store in stores() {
            let key = derive_key("/broken");
            store.insert_raw(key.as_bytes(), b"{not json").unwrap();
            assert_eq!(store.get(&key).unwrap(), None);
            let stats = store.stats();
            assert_eq!(stats.corrupt, 1);
            assert_eq!(stats.absent, 0);
        }
    }

    #[test]
    fn scan_reports_corrupt_records_and_continues() {
        for store in stores() {
            let good = derive_key("/good");
            store.set(&good, &entry("ok", 5)).unwrap();
            store.insert_raw(derive_key("/bad").as_bytes(), b"\xff").unwrap();
            store.insert_raw(b"short-key", b"{}").unwrap();

            let (ok, bad): (Vec<_>, Vec<_>) = store.scan_all().partition(Result::is_ok);
            assert_eq!(ok.len(), 1);
            assert_eq!(bad.len(), 2);
            assert!(bad.iter().all(|r| matches!(r, Err(StoreError::Corrupt { .. }))));
        }
    }

    #[test]
    fn clones_share_state() {
        let store = CacheStore::in_memory();
        let other = store.clone();
        let key = derive_key("/shared");
        store.set(&key, &entry("x", 5)).unwrap();
        assert!(other.get(&key).unwrap().is_some());
        assert_eq!(other.stats().writes, 1);
    }

    #[test]
    fn open_fails_when_path_is_a_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(CacheStore::open(file.path()).is_err());
    }
}
