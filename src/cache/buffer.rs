//! Cache entries and the reference-counted handles that borrow them.
//!
//! An entry is a fixed-size byte region plus a `used` watermark, guarded by
//! a reader/writer lock. A short meta mutex guards the reference count and
//! last-reference timestamp; the evictor consults both. Handles increment
//! the reference count on creation and decrement exactly once on `Drop`, so
//! an entry can never be torn down while borrowed.

use parking_lot::{
    ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::sync::Arc;
use std::time::Instant;

/// Byte region of one entry. `data.len()` is the immutable size declared at
/// creation; `used` is mutated only by writer-lock holders.
pub(crate) struct BufferData {
    pub(crate) data: Box<[u8]>,
    pub(crate) used: usize,
}

pub(crate) struct EntryMeta {
    pub(crate) reference_count: usize,
    pub(crate) last_reference_time: Instant,
}

/// One cached file. Lives in a bucket chain behind an `Arc`; handles hold
/// the same `Arc`, so the manager can drop the entry from its table while
/// readers finish.
pub(crate) struct CacheEntry {
    key: Box<str>,
    bucket: usize,
    size: usize,
    bytes: Arc<RwLock<BufferData>>,
    meta: Mutex<EntryMeta>,
}

impl CacheEntry {
    pub(crate) fn new(key: &str, bucket: usize, size: usize) -> Self {
        Self {
            key: key.into(),
            bucket,
            size,
            bytes: Arc::new(RwLock::new(BufferData {
                data: vec![0; size].into_boxed_slice(),
                used: 0,
            })),
            meta: Mutex::new(EntryMeta {
                reference_count: 0,
                last_reference_time: Instant::now(),
            }),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn bucket(&self) -> usize {
        self.bucket
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn reference_count(&self) -> usize {
        self.meta.lock().reference_count
    }

    pub(crate) fn last_reference_time(&self) -> Instant {
        self.meta.lock().last_reference_time
    }

    pub(crate) fn acquire(&self) {
        let mut meta = self.meta.lock();
        meta.reference_count += 1;
        meta.last_reference_time = Instant::now();
    }

    fn release(&self) {
        let mut meta = self.meta.lock();
        debug_assert!(meta.reference_count > 0);
        meta.reference_count = meta.reference_count.saturating_sub(1);
    }
}

/// Shared borrow of a cached buffer, handed out by
/// [`CacheManager::read_handle`](crate::cache::CacheManager::read_handle).
///
/// Holding the handle pins the entry against eviction; the buffer bytes are
/// only reachable through [`lock`](Self::lock), which blocks while a fill
/// holds the writer lock.
pub struct ReadHandle {
    entry: Arc<CacheEntry>,
}

impl ReadHandle {
    pub(crate) fn new(entry: Arc<CacheEntry>) -> Self {
        entry.acquire();
        Self { entry }
    }

    /// Declared size of the buffer.
    pub fn size(&self) -> usize {
        self.entry.size
    }

    /// Bytes of valid content. Blocks while a writer holds the lock, so a
    /// writer observes its own committed length here without a second
    /// lookup.
    pub fn used(&self) -> usize {
        self.entry.bytes.read().used
    }

    /// Takes the shared lock on the buffer. May block during an initial
    /// fill of the entry.
    pub fn lock(&self) -> BodyGuard<'_> {
        BodyGuard {
            guard: self.entry.bytes.read(),
        }
    }

    pub(crate) fn key(&self) -> &str {
        self.entry.key()
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        self.entry.release();
    }
}

/// Shared-lock view of the valid content of a buffer.
pub struct BodyGuard<'a> {
    guard: RwLockReadGuard<'a, BufferData>,
}

impl BodyGuard<'_> {
    pub fn bytes(&self) -> &[u8] {
        &self.guard.data[..self.guard.used]
    }

    pub fn used(&self) -> usize {
        self.guard.used
    }
}

/// Exclusive borrow of a cached buffer, handed out by
/// [`CacheManager::write_handle`](crate::cache::CacheManager::write_handle).
pub struct WriteHandle {
    entry: Arc<CacheEntry>,
}

impl WriteHandle {
    pub(crate) fn new(entry: Arc<CacheEntry>) -> Self {
        entry.acquire();
        Self { entry }
    }

    pub fn size(&self) -> usize {
        self.entry.size
    }

    /// Takes the exclusive lock for a scoped write.
    pub fn lock(&self) -> WriteGuard<'_> {
        WriteGuard {
            guard: self.entry.bytes.write(),
        }
    }

    /// Takes the exclusive lock and carries it inside the returned
    /// [`FillGuard`], which holds it until dropped. Used to keep readers
    /// out for the whole duration of an asynchronous fill.
    pub fn into_fill(self) -> FillGuard {
        let guard = self.entry.bytes.write_arc();
        FillGuard {
            guard,
            _handle: self,
        }
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        self.entry.release();
    }
}

/// Exclusive-lock view for a scoped write.
pub struct WriteGuard<'a> {
    guard: RwLockWriteGuard<'a, BufferData>,
}

impl WriteGuard<'_> {
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.guard.data
    }

    pub fn used(&self) -> usize {
        self.guard.used
    }

    /// Records how many bytes of the buffer are valid content, clamped to
    /// the buffer size.
    pub fn commit(&mut self, used: usize) {
        self.guard.used = used.min(self.guard.data.len());
    }
}

/// Writer lock held across an asynchronous fill.
///
/// Created on the planning thread before the entry's first reader can
/// observe it, moved into the reader pool with the read request, and
/// dropped once the outcome is delivered. Readers of the entry block on
/// [`ReadHandle::lock`] until then, so partially-filled content is never
/// served. The guard also keeps a reference on the entry, pinning it
/// against eviction for the duration.
pub struct FillGuard {
    // Field order matters: the lock is released before the reference.
    guard: ArcRwLockWriteGuard<RawRwLock, BufferData>,
    _handle: WriteHandle,
}

impl FillGuard {
    /// Capacity of the destination region.
    pub fn capacity(&self) -> usize {
        self.guard.data.len()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.guard.data
    }

    /// Records the filled length, clamped to capacity.
    pub fn commit(&mut self, used: usize) {
        self.guard.used = used.min(self.guard.data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(size: usize) -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new("/test", 0, size))
    }

    #[test]
    fn handles_track_reference_count() {
        let e = entry(16);
        assert_eq!(e.reference_count(), 0);

        let read = ReadHandle::new(e.clone());
        let write = WriteHandle::new(e.clone());
        assert_eq!(e.reference_count(), 2);

        drop(read);
        assert_eq!(e.reference_count(), 1);
        drop(write);
        assert_eq!(e.reference_count(), 0);
    }

    #[test]
    fn write_is_visible_through_read_handle() {
        let e = entry(16);
        let read = ReadHandle::new(e.clone());
        let write = WriteHandle::new(e.clone());

        {
            let mut guard = write.lock();
            guard.bytes_mut()[..5].copy_from_slice(b"hello");
            guard.commit(5);
        }

        assert_eq!(read.used(), 5);
        assert_eq!(read.lock().bytes(), b"hello");
    }

    #[test]
    fn fill_guard_keeps_entry_pinned() {
        let e = entry(8);
        let write = WriteHandle::new(e.clone());

        let mut fill = write.into_fill();
        assert_eq!(e.reference_count(), 1);
        assert_eq!(fill.capacity(), 8);

        fill.bytes_mut()[..3].copy_from_slice(b"abc");
        fill.commit(3);
        drop(fill);

        assert_eq!(e.reference_count(), 0);
        let read = ReadHandle::new(e);
        assert_eq!(read.lock().bytes(), b"abc");
    }

    #[test]
    fn commit_clamps_to_capacity() {
        let e = entry(4);
        let write = WriteHandle::new(e);
        let mut guard = write.lock();
        guard.commit(100);
        assert_eq!(guard.used(), 4);
    }
}
