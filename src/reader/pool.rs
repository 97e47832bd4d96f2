//! Bounded thread pool for blocking file reads off the request path.
//!
//! Workers pop requests from a pending queue under one mutex, perform the
//! open/stat/read sequence with the mutex released, then record the outcome
//! and deliver it through the request's callback. Callbacks always run with
//! the pool mutex released and must not call back into the pool
//! synchronously.

use crate::errors::ReaderError;
use crate::reader::stat::{FileKind, FileStat};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};
use uuid::Uuid;

/// Destination buffer for an asynchronous read.
///
/// The pool owns the destination for the lifetime of the request and drops
/// it immediately before the callback runs, so any lock the destination
/// carries is released by the time the outcome is observable.
pub trait ReadDest: Send + 'static {
    /// Capacity in bytes; files larger than this fail with
    /// [`ReaderError::FileTooLarge`].
    fn capacity(&self) -> usize;

    fn bytes_mut(&mut self) -> &mut [u8];

    /// Records the number of valid bytes after a successful read.
    fn commit(&mut self, used: usize);
}

/// Delivered to the callback exactly once per queued request.
pub struct ReadOutcome {
    pub request_id: Uuid,
    pub path: PathBuf,
    pub result: Result<usize, ReaderError>,
}

pub type ReadCallback = Box<dyn FnOnce(ReadOutcome) + Send + 'static>;

pub struct ReadRequest {
    pub path: PathBuf,
    pub dest: Box<dyn ReadDest>,
    pub callback: ReadCallback,
}

/// Consistent snapshot of the pool counters.
/// `completed + failed + canceled + pending == total` at all times.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    pub total: usize,
    pub pending: usize,
}

struct QueuedRead {
    request_id: Uuid,
    request: ReadRequest,
}

struct InFlight {
    request_id: Uuid,
    canceled: Arc<AtomicBool>,
}

struct State {
    pending: VecDeque<QueuedRead>,
    slots: Vec<Option<InFlight>>,
    stats: PoolStats,
    shutdown: bool,
    abort: bool,
}

struct Shared {
    state: Mutex<State>,
    not_empty: Condvar,
    max_requests: usize,
}

pub struct FileReaderPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl FileReaderPool {
    /// Spawns `worker_count` reader threads (both parameters are clamped
    /// to at least 1).
    pub fn new(limits: crate::limits::ReaderLimits) -> Self {
        let worker_count = limits.worker_count.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                pending: VecDeque::new(),
                slots: (0..worker_count).map(|_| None).collect(),
                stats: PoolStats::default(),
                shutdown: false,
                abort: false,
            }),
            not_empty: Condvar::new(),
            max_requests: limits.max_requests.max(1),
        });

        let threads = (0..worker_count)
            .map(|worker_id| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("reader-{worker_id}"))
                    .spawn(move || worker_loop(&shared, worker_id))
                    .expect("spawning reader thread")
            })
            .collect();

        Self {
            shared,
            threads: Mutex::new(threads),
        }
    }

    /// Appends a read request to the pending queue and wakes one worker.
    ///
    /// Returns the unique id of the request, usable with
    /// [`cancel`](Self::cancel).
    pub fn queue(&self, request: ReadRequest) -> Result<Uuid, ReaderError> {
        if request.path.as_os_str().is_empty() || request.dest.capacity() == 0 {
            return Err(ReaderError::InvalidParameter);
        }

        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(ReaderError::Shutdown);
        }
        if state.stats.pending >= self.shared.max_requests {
            return Err(ReaderError::MaxRequestsExceeded);
        }

        let request_id = Uuid::new_v4();
        state.pending.push_back(QueuedRead {
            request_id,
            request,
        });
        state.stats.total += 1;
        state.stats.pending += 1;
        self.shared.not_empty.notify_one();
        debug!(%request_id, "read request queued");

        Ok(request_id)
    }

    /// Cancels a pending or in-flight request.
    ///
    /// A pending request is removed and its callback invoked with
    /// [`ReaderError::Canceled`] before this returns. An in-flight request
    /// is flagged; its read loop observes the flag between chunks and
    /// delivers the canceled outcome from the worker thread.
    pub fn cancel(&self, request_id: Uuid) -> Result<(), ReaderError> {
        let removed = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return Err(ReaderError::Shutdown);
            }

            let position = state
                .pending
                .iter()
                .position(|queued| queued.request_id == request_id);
            match position.and_then(|index| state.pending.remove(index)) {
                Some(queued) => {
                    state.stats.canceled += 1;
                    state.stats.pending -= 1;
                    queued
                }
                None => {
                    for slot in state.slots.iter().flatten() {
                        if slot.request_id == request_id {
                            slot.canceled.store(true, Ordering::Relaxed);
                            return Ok(());
                        }
                    }
                    return Err(ReaderError::RequestNotFound);
                }
            }
        };

        deliver(removed, Err(ReaderError::Canceled));
        Ok(())
    }

    /// Abrupt shutdown: cancels every pending and in-flight request, then
    /// joins the worker threads. Idempotent.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.abort = true;

            let drained: Vec<QueuedRead> = state.pending.drain(..).collect();
            state.stats.canceled += drained.len();
            state.stats.pending -= drained.len();

            for slot in state.slots.iter().flatten() {
                slot.canceled.store(true, Ordering::Relaxed);
            }
            self.not_empty_broadcast();
            drained
        };

        for queued in drained {
            deliver(queued, Err(ReaderError::Canceled));
        }
        self.join();
    }

    /// Graceful shutdown: stops accepting requests, lets the queue drain
    /// to completion, then joins the worker threads.
    pub fn graceful_shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.not_empty_broadcast();
            drop(state);
        }
        self.join();
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.state.lock().stats
    }

    fn not_empty_broadcast(&self) {
        self.shared.not_empty.notify_all();
    }

    fn join(&self) {
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                warn!("reader thread panicked");
            }
        }
    }
}

impl Drop for FileReaderPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deliver(queued: QueuedRead, result: Result<usize, ReaderError>) {
    let QueuedRead {
        request_id,
        request,
    } = queued;
    let ReadRequest {
        path,
        dest,
        callback,
    } = request;

    // Release the destination (and any lock it holds) before announcing
    // the outcome, so the recipient observes a fully settled buffer.
    drop(dest);

    callback(ReadOutcome {
        request_id,
        path,
        result,
    });
}

fn worker_loop(shared: &Shared, worker_id: usize) {
    loop {
        let (queued, canceled) = {
            let mut state = shared.state.lock();
            loop {
                if state.abort || (state.shutdown && state.pending.is_empty()) {
                    return;
                }
                match state.pending.pop_front() {
                    Some(queued) => {
                        let canceled = Arc::new(AtomicBool::new(false));
                        state.slots[worker_id] = Some(InFlight {
                            request_id: queued.request_id,
                            canceled: canceled.clone(),
                        });
                        break (queued, canceled);
                    }
                    None => shared.not_empty.wait(&mut state),
                }
            }
        };

        let mut request = queued.request;
        let result = perform_read(&request.path, request.dest.as_mut(), &canceled);

        {
            let mut state = shared.state.lock();
            state.slots[worker_id] = None;
            state.stats.pending -= 1;
            match &result {
                Ok(_) => state.stats.completed += 1,
                Err(ReaderError::Canceled) => state.stats.canceled += 1,
                Err(_) => state.stats.failed += 1,
            }
        }

        deliver(
            QueuedRead {
                request_id: queued.request_id,
                request,
            },
            result,
        );
    }
}

/// Open, stat, and read one file into the destination, checking the
/// cancellation flag between chunks.
fn perform_read(
    path: &Path,
    dest: &mut dyn ReadDest,
    canceled: &AtomicBool,
) -> Result<usize, ReaderError> {
    let mut file = File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => ReaderError::FileNotFound,
        _ => ReaderError::ReadingFile(err),
    })?;

    let stat = FileStat::probe_file(&file)?;
    if stat.kind != FileKind::Regular {
        return Err(ReaderError::FileNotRegularFile);
    }
    if stat.len > dest.capacity() as u64 {
        return Err(ReaderError::FileTooLarge {
            size: stat.len,
            capacity: dest.capacity(),
        });
    }

    const CHUNK: usize = 64 * 1024;
    let mut filled = 0;
    {
        let buffer = dest.bytes_mut();
        loop {
            if canceled.load(Ordering::Relaxed) {
                return Err(ReaderError::Canceled);
            }
            let end = (filled + CHUNK).min(buffer.len());
            if filled == end {
                break;
            }
            match file.read(&mut buffer[filled..end]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ReaderError::ReadingFile(err)),
            }
        }
    }

    if canceled.load(Ordering::Relaxed) {
        return Err(ReaderError::Canceled);
    }

    dest.commit(filled);
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ReaderLimits;
    use std::io::Write;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Plain heap destination that mirrors committed content for the test
    /// to inspect after the callback fired.
    struct TestDest {
        buffer: Vec<u8>,
        mirror: Arc<Mutex<Option<Vec<u8>>>>,
    }

    impl TestDest {
        fn new(capacity: usize) -> (Box<Self>, Arc<Mutex<Option<Vec<u8>>>>) {
            let mirror = Arc::new(Mutex::new(None));
            (
                Box::new(Self {
                    buffer: vec![0; capacity],
                    mirror: mirror.clone(),
                }),
                mirror,
            )
        }
    }

    impl ReadDest for TestDest {
        fn capacity(&self) -> usize {
            self.buffer.len()
        }

        fn bytes_mut(&mut self) -> &mut [u8] {
            &mut self.buffer
        }

        fn commit(&mut self, used: usize) {
            *self.mirror.lock() = Some(self.buffer[..used].to_vec());
        }
    }

    fn pool(max_requests: usize, worker_count: usize) -> FileReaderPool {
        FileReaderPool::new(ReaderLimits {
            max_requests,
            worker_count,
        })
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        File::create(&path).unwrap().write_all(content).unwrap();
        path
    }

    fn channel_callback(tx: mpsc::Sender<ReadOutcome>) -> ReadCallback {
        Box::new(move |outcome| {
            let _ = tx.send(outcome);
        })
    }

    #[test]
    fn reads_file_into_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "test.txt", b"Hello World\n");

        let pool = pool(10, 2);
        let (dest, mirror) = TestDest::new(100);
        let (tx, rx) = mpsc::channel();

        let id = pool
            .queue(ReadRequest {
                path: path.clone(),
                dest,
                callback: channel_callback(tx),
            })
            .unwrap();

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.request_id, id);
        assert_eq!(outcome.path, path);
        assert_eq!(outcome.result.unwrap(), 12);
        assert_eq!(mirror.lock().as_deref(), Some(b"Hello World\n" as &[u8]));

        // Exactly one callback.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        let stats = pool.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(10, 1);
        let (dest, _) = TestDest::new(16);
        let (tx, rx) = mpsc::channel();

        pool.queue(ReadRequest {
            path: dir.path().join("missing.txt"),
            dest,
            callback: channel_callback(tx),
        })
        .unwrap();

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome.result, Err(ReaderError::FileNotFound)));
        assert_eq!(pool.stats().failed, 1);
    }

    #[test]
    fn directory_is_not_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(10, 1);
        let (dest, _) = TestDest::new(16);
        let (tx, rx) = mpsc::channel();

        pool.queue(ReadRequest {
            path: dir.path().to_path_buf(),
            dest,
            callback: channel_callback(tx),
        })
        .unwrap();

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            outcome.result,
            Err(ReaderError::FileNotRegularFile)
        ));
    }

    #[test]
    fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "big.txt", &[0u8; 64]);

        let pool = pool(10, 1);
        let (dest, _) = TestDest::new(16);
        let (tx, rx) = mpsc::channel();

        pool.queue(ReadRequest {
            path,
            dest,
            callback: channel_callback(tx),
        })
        .unwrap();

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            outcome.result,
            Err(ReaderError::FileTooLarge { size: 64, .. })
        ));
    }

    #[test]
    fn rejects_invalid_parameters() {
        let pool = pool(10, 1);
        let (dest, _) = TestDest::new(0);
        let result = pool.queue(ReadRequest {
            path: PathBuf::from("/some/file"),
            dest,
            callback: Box::new(|_| {}),
        });
        assert!(matches!(result, Err(ReaderError::InvalidParameter)));
    }

    #[test]
    fn cancel_pending_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "f.txt", b"content");

        // One worker, parked inside the first request's callback so the
        // second request stays pending.
        let pool = pool(10, 1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        let (dest, _) = TestDest::new(64);
        pool.queue(ReadRequest {
            path: path.clone(),
            dest,
            callback: Box::new(move |_| {
                gate_rx.recv_timeout(Duration::from_secs(5)).ok();
            }),
        })
        .unwrap();

        // Give the worker a moment to pick up the first request, then park
        // a second one behind it.
        std::thread::sleep(Duration::from_millis(200));
        let (dest, _) = TestDest::new(64);
        let id = pool
            .queue(ReadRequest {
                path,
                dest,
                callback: channel_callback(done_tx),
            })
            .unwrap();

        assert!(pool.cancel(id).is_ok());
        let outcome = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome.result, Err(ReaderError::Canceled)));

        gate_tx.send(()).unwrap();
        pool.graceful_shutdown();

        let stats = pool.stats();
        assert_eq!(stats.canceled, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.total, 2);
    }

    #[test]
    fn cancel_unknown_request() {
        let pool = pool(10, 1);
        assert!(matches!(
            pool.cancel(Uuid::new_v4()),
            Err(ReaderError::RequestNotFound)
        ));
    }

    #[test]
    fn queue_limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "f.txt", b"x");

        // One worker, parked in the first request's callback after that
        // request finished, so later requests stay pending.
        let pool = pool(1, 1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        let (dest, _) = TestDest::new(8);
        pool.queue(ReadRequest {
            path: path.clone(),
            dest,
            callback: Box::new(move |_| {
                gate_rx.recv_timeout(Duration::from_secs(5)).ok();
            }),
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let (dest, _) = TestDest::new(8);
        pool.queue(ReadRequest {
            path: path.clone(),
            dest,
            callback: Box::new(|_| {}),
        })
        .unwrap();

        let (dest, _) = TestDest::new(8);
        let result = pool.queue(ReadRequest {
            path,
            dest,
            callback: Box::new(|_| {}),
        });
        assert!(matches!(result, Err(ReaderError::MaxRequestsExceeded)));

        gate_tx.send(()).unwrap();
        pool.graceful_shutdown();
        assert_eq!(pool.stats().completed, 2);
    }

    #[test]
    fn graceful_shutdown_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "f.txt", b"data");

        let pool = pool(10, 2);
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let (dest, _) = TestDest::new(16);
            pool.queue(ReadRequest {
                path: path.clone(),
                dest,
                callback: channel_callback(tx.clone()),
            })
            .unwrap();
        }

        pool.graceful_shutdown();

        let outcomes: Vec<ReadOutcome> = rx.try_iter().collect();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));

        let stats = pool.stats();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.pending, 0);

        // The pool accepts nothing afterwards.
        let (dest, _) = TestDest::new(16);
        assert!(matches!(
            pool.queue(ReadRequest {
                path,
                dest,
                callback: Box::new(|_| {}),
            }),
            Err(ReaderError::Shutdown)
        ));
    }

    #[test]
    fn abrupt_shutdown_cancels_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "f.txt", b"data");

        let pool = pool(10, 1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel();

        let (dest, _) = TestDest::new(16);
        pool.queue(ReadRequest {
            path: path.clone(),
            dest,
            callback: Box::new(move |_| {
                gate_rx.recv_timeout(Duration::from_secs(5)).ok();
            }),
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        let (dest, _) = TestDest::new(16);
        pool.queue(ReadRequest {
            path,
            dest,
            callback: channel_callback(tx),
        })
        .unwrap();

        let shutdown = std::thread::spawn({
            let gate_tx = gate_tx.clone();
            move || {
                // Unblock the in-flight callback so the join can finish.
                std::thread::sleep(Duration::from_millis(100));
                gate_tx.send(()).ok();
            }
        });

        pool.shutdown();
        shutdown.join().unwrap();

        let outcome = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(outcome.result, Err(ReaderError::Canceled)));

        let stats = pool.stats();
        assert_eq!(stats.canceled, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.completed + stats.failed + stats.canceled, stats.total);
    }
}
