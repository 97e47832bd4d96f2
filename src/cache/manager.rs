//! The keyed buffer store shared by all workers.
//!
//! One authoritative buffer per key, held in a fixed-size hash table
//! (djb2 modulo `max_entries`, separate chaining). Admission past the
//! memory or entry-count bound evicts least-recently-used unreferenced
//! entries, all or nothing: if the unreferenced set cannot cover the
//! deficit, nothing is evicted and the capacity error is returned.

use crate::cache::buffer::{CacheEntry, ReadHandle, WriteHandle};
use crate::errors::CacheError;
use crate::limits::CacheLimits;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub struct CacheManager {
    limits: CacheLimits,
    inner: Mutex<Inner>,
}

struct Inner {
    buckets: Box<[Vec<Arc<CacheEntry>>]>,
    used_memory: usize,
    entry_count: usize,
}

/// Snapshot of an evictable entry, taken under the manager mutex.
struct LruCandidate {
    key: Box<str>,
    size: usize,
    last_reference_time: Instant,
}

fn djb2(key: &str) -> u64 {
    let mut hash: u64 = 5381;
    for &byte in key.as_bytes() {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(u64::from(byte));
    }
    hash
}

impl CacheManager {
    pub fn new(limits: CacheLimits) -> Self {
        let buckets = vec![Vec::new(); limits.max_entries.max(1)].into_boxed_slice();
        Self {
            limits,
            inner: Mutex::new(Inner {
                buckets,
                used_memory: 0,
                entry_count: 0,
            }),
        }
    }

    fn bucket_of(&self, key: &str) -> usize {
        (djb2(key) % self.limits.max_entries.max(1) as u64) as usize
    }

    /// Admits a new entry of `size` zeroed bytes under `key`.
    ///
    /// Fails fast with [`CacheError::BufferSizeLimit`] above the per-entry
    /// ceiling and with [`CacheError::DuplicateKey`] if the key is already
    /// present. Capacity shortfalls attempt LRU eviction of unreferenced
    /// entries first; when eviction cannot cover the deficit nothing is
    /// evicted and [`CacheError::MemoryLimitExceeded`] or
    /// [`CacheError::BufferCountExceeded`] is returned.
    pub fn create(&self, key: &str, size: usize) -> Result<(), CacheError> {
        if size > self.limits.max_buffer_size {
            return Err(CacheError::BufferSizeLimit {
                requested: size,
                limit: self.limits.max_buffer_size,
            });
        }

        let bucket = self.bucket_of(key);
        let mut inner = self.inner.lock();

        if Self::find(&inner, bucket, key).is_some() {
            return Err(CacheError::DuplicateKey);
        }

        if inner.used_memory + size > self.limits.max_memory {
            let deficit = size - (self.limits.max_memory - inner.used_memory);
            Self::evict_memory(&mut inner, deficit)
                .map_err(|_| CacheError::MemoryLimitExceeded)?;
            if inner.used_memory + size > self.limits.max_memory {
                return Err(CacheError::MemoryLimitExceeded);
            }
        }

        if inner.entry_count >= self.limits.max_entries {
            let excess = inner.entry_count - self.limits.max_entries + 1;
            Self::evict_count(&mut inner, excess)
                .map_err(|_| CacheError::BufferCountExceeded)?;
            if inner.entry_count >= self.limits.max_entries {
                return Err(CacheError::BufferCountExceeded);
            }
        }

        let entry = Arc::new(CacheEntry::new(key, bucket, size));
        inner.buckets[bucket].push(entry);
        inner.entry_count += 1;
        inner.used_memory += size;

        debug!(key, size, "cache entry created");
        Ok(())
    }

    /// Looks up `key` and returns a shared, reference-counted borrow.
    pub fn read_handle(&self, key: &str) -> Option<ReadHandle> {
        let bucket = self.bucket_of(key);
        let inner = self.inner.lock();
        Self::find(&inner, bucket, key).map(ReadHandle::new)
    }

    /// Looks up `key` and returns an exclusive, reference-counted borrow.
    pub fn write_handle(&self, key: &str) -> Option<WriteHandle> {
        let bucket = self.bucket_of(key);
        let inner = self.inner.lock();
        Self::find(&inner, bucket, key).map(WriteHandle::new)
    }

    /// Deletes the entry under `key` if no handle pins it.
    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        let bucket = self.bucket_of(key);
        let mut inner = self.inner.lock();
        Self::remove_locked(&mut inner, bucket, key)
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().entry_count
    }

    /// Sum of the declared sizes of all live entries.
    pub fn used_memory(&self) -> usize {
        self.inner.lock().used_memory
    }

    fn find(inner: &Inner, bucket: usize, key: &str) -> Option<Arc<CacheEntry>> {
        inner.buckets[bucket]
            .iter()
            .find(|entry| entry.key() == key)
            .cloned()
    }

    fn remove_locked(inner: &mut Inner, bucket: usize, key: &str) -> Result<(), CacheError> {
        let chain = &mut inner.buckets[bucket];
        let index = chain
            .iter()
            .position(|entry| entry.key() == key)
            .ok_or(CacheError::KeyNotFound)?;

        // Re-check under the meta mutex right before deletion.
        if chain[index].reference_count() != 0 {
            return Err(CacheError::BufferReferenced);
        }

        let entry = chain.swap_remove(index);
        inner.used_memory -= entry.size();
        inner.entry_count -= 1;
        debug!(key, "cache entry evicted");
        Ok(())
    }

    /// All unreferenced entries, least recently used first. Ties are broken
    /// by key so a given state always evicts in the same order.
    fn unreferenced(inner: &Inner) -> Vec<LruCandidate> {
        let mut candidates: Vec<LruCandidate> = inner
            .buckets
            .iter()
            .flatten()
            .filter(|entry| entry.reference_count() == 0)
            .map(|entry| LruCandidate {
                key: entry.key().into(),
                size: entry.size(),
                last_reference_time: entry.last_reference_time(),
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.last_reference_time
                .cmp(&b.last_reference_time)
                .then_with(|| a.key.cmp(&b.key))
        });
        candidates
    }

    /// Frees at least `need` bytes by deleting LRU unreferenced entries.
    /// Checks the total up front so a shortfall deletes nothing.
    fn evict_memory(inner: &mut Inner, need: usize) -> Result<(), CacheError> {
        let candidates = Self::unreferenced(inner);
        let available: usize = candidates.iter().map(|c| c.size).sum();
        if available < need {
            return Err(CacheError::BuffersUsed);
        }

        let mut freed = 0;
        for candidate in candidates {
            if freed >= need {
                break;
            }
            let bucket = (djb2(&candidate.key) % inner.buckets.len() as u64) as usize;
            if Self::remove_locked(inner, bucket, &candidate.key).is_ok() {
                freed += candidate.size;
            }
        }

        if freed < need {
            return Err(CacheError::BuffersUsed);
        }
        Ok(())
    }

    /// Deletes the `count` least recently used unreferenced entries.
    fn evict_count(inner: &mut Inner, count: usize) -> Result<(), CacheError> {
        let candidates = Self::unreferenced(inner);
        if candidates.len() < count {
            return Err(CacheError::BuffersUsed);
        }

        let mut freed = 0;
        for candidate in candidates {
            if freed >= count {
                break;
            }
            let bucket = (djb2(&candidate.key) % inner.buckets.len() as u64) as usize;
            if Self::remove_locked(inner, bucket, &candidate.key).is_ok() {
                freed += 1;
            }
        }

        if freed < count {
            return Err(CacheError::BuffersUsed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::CacheLimits;

    fn manager(max_memory: usize, max_entries: usize, max_buffer_size: usize) -> CacheManager {
        CacheManager::new(CacheLimits {
            max_memory,
            max_entries,
            max_buffer_size,
        })
    }

    #[test]
    fn create_and_lookup() {
        let cache = manager(1000, 10, 100);
        assert_eq!(cache.create("k", 50), Ok(()));

        let handle = cache.read_handle("k").unwrap();
        assert_eq!(handle.size(), 50);
        assert_eq!(handle.used(), 0);

        assert_eq!(cache.used_memory(), 50);
        assert_eq!(cache.entry_count(), 1);
        assert!(cache.read_handle("missing").is_none());
    }

    #[test]
    fn rejects_oversized_buffer() {
        let cache = manager(1000, 10, 100);
        assert_eq!(
            cache.create("big", 101),
            Err(CacheError::BufferSizeLimit {
                requested: 101,
                limit: 100
            })
        );
    }

    #[test]
    fn rejects_duplicate_key() {
        let cache = manager(1000, 10, 100);
        assert_eq!(cache.create("k", 10), Ok(()));
        assert_eq!(cache.create("k", 10), Err(CacheError::DuplicateKey));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn memory_limit_without_evictable_entries() {
        let cache = manager(50, 10, 100);
        assert_eq!(cache.create("a", 40), Ok(()));

        // "a" is unreferenced but evicting it would still not fit 60 bytes.
        assert_eq!(cache.create("b", 60), Err(CacheError::MemoryLimitExceeded));
        assert_eq!(cache.used_memory(), 40);
        assert!(cache.read_handle("a").is_some());
    }

    #[test]
    fn pinned_entry_blocks_memory_eviction() {
        let cache = manager(100, 10, 100);
        assert_eq!(cache.create("a", 50), Ok(()));
        let pin = cache.read_handle("a").unwrap();

        assert_eq!(cache.create("b", 60), Err(CacheError::MemoryLimitExceeded));
        assert_eq!(cache.used_memory(), 50);
        drop(pin);

        // Unpinned, the same admission now evicts "a".
        assert_eq!(cache.create("b", 60), Ok(()));
        assert!(cache.read_handle("a").is_none());
        assert_eq!(cache.used_memory(), 60);
    }

    #[test]
    fn count_eviction_takes_least_recently_used() {
        let cache = manager(1000, 2, 100);
        assert_eq!(cache.create("a", 50), Ok(()));
        assert_eq!(cache.create("b", 50), Ok(()));

        let pin_a = cache.read_handle("a").unwrap();
        drop(cache.read_handle("b").unwrap());

        // "a" is pinned, so the count eviction must take "b".
        assert_eq!(cache.create("c", 50), Ok(()));
        assert!(cache.read_handle("b").is_none());
        assert!(cache.read_handle("c").is_some());
        drop(pin_a);
        assert_eq!(cache.entry_count(), 2);
    }

    #[test]
    fn count_limit_with_all_entries_pinned() {
        let cache = manager(1000, 1, 100);
        assert_eq!(cache.create("a", 10), Ok(()));
        let pin = cache.read_handle("a").unwrap();

        assert_eq!(cache.create("b", 10), Err(CacheError::BufferCountExceeded));
        drop(pin);
    }

    #[test]
    fn eviction_is_all_or_nothing() {
        let cache = manager(100, 10, 100);
        assert_eq!(cache.create("a", 30), Ok(()));
        assert_eq!(cache.create("b", 30), Ok(()));
        let pin = cache.read_handle("b").unwrap();

        // Fitting 80 bytes needs 40 freed; only "a" (30) is unreferenced.
        // Nothing may be evicted.
        assert_eq!(cache.create("c", 80), Err(CacheError::MemoryLimitExceeded));
        assert!(cache.read_handle("a").is_some());
        assert_eq!(cache.used_memory(), 60);
        drop(pin);
    }

    #[test]
    fn lru_order_follows_last_reference() {
        let cache = manager(100, 10, 100);
        assert_eq!(cache.create("old", 40), Ok(()));
        assert_eq!(cache.create("new", 40), Ok(()));

        // Touch "old" so "new" becomes the least recently used.
        drop(cache.read_handle("new").unwrap());
        drop(cache.read_handle("old").unwrap());

        assert_eq!(cache.create("next", 60), Ok(()));
        assert!(cache.read_handle("old").is_some());
        assert!(cache.read_handle("new").is_none());
    }

    #[test]
    fn remove_respects_references() {
        let cache = manager(1000, 10, 100);
        assert_eq!(cache.create("k", 10), Ok(()));

        let pin = cache.read_handle("k").unwrap();
        assert_eq!(cache.remove("k"), Err(CacheError::BufferReferenced));
        drop(pin);

        assert_eq!(cache.remove("k"), Ok(()));
        assert_eq!(cache.remove("k"), Err(CacheError::KeyNotFound));
        assert_eq!(cache.used_memory(), 0);
    }

    #[test]
    fn write_read_round_trip() {
        let cache = manager(1000, 10, 100);
        let content = b"Hello World\n";
        assert_eq!(cache.create("/file", content.len()), Ok(()));

        let write = cache.write_handle("/file").unwrap();
        {
            let mut guard = write.lock();
            guard.bytes_mut()[..content.len()].copy_from_slice(content);
            guard.commit(content.len());
        }
        drop(write);

        let read = cache.read_handle("/file").unwrap();
        assert_eq!(read.used(), content.len());
        assert_eq!(read.lock().bytes(), content);
    }
}
