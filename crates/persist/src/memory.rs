use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::driver::{PutOptions, StorageDriver};
use crate::error::DriverError;

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
    metadata: BTreeMap<String, String>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Operation counters, mostly useful to assert what a caller touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
}

/// In-process driver backed by an ordered map.
///
/// Expired entries are dropped lazily when `get`/`has` touch them and skipped
/// by `keys`; `compact` sweeps the rest.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    entries: Mutex<BTreeMap<String, Entry>>,
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DriverStats {
        DriverStats {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    /// Number of stored entries, expired ones included.
    pub fn raw_len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Metadata stored with a live entry.
    pub fn metadata(&self, key: &str) -> Option<BTreeMap<String, String>> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.metadata.clone())
    }

    fn live_entry(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                tracing::trace!(key, "expired entry dropped");
                None
            }
            Some(entry) => Some(entry.data.clone()),
            None => None,
        }
    }
}

impl StorageDriver for MemoryDriver {
    async fn put(&self, key: &str, data: Vec<u8>, options: PutOptions) -> Result<(), DriverError> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            data,
            expires_at: options.ttl.map(|ttl| Instant::now() + ttl),
            metadata: options.metadata,
        };
        self.entries.lock().insert(key.to_owned(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.live_entry(key))
    }

    async fn delete(&self, key: &str) -> Result<(), DriverError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, DriverError> {
        Ok(self.live_entry(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, DriverError> {
        let entries = self.entries.lock();
        let now = Instant::now();
        Ok(entries
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn clear(&self) -> Result<(), DriverError> {
        self.entries.lock().clear();
        Ok(())
    }

    async fn compact(&self) -> Result<usize, DriverError> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        tracing::debug!(removed, "memory driver compacted");
        Ok(removed)
    }
}
