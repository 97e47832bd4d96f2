//! Worker threads.
//!
//! Each worker owns a set of connections and drives them through the
//! request state machine on its own thread: readiness events from `mio`
//! feed `handle_read`/`handle_write`, reader-pool completions arrive over a
//! channel and wake the poll, and new connections come in through the
//! mutex-protected inbox. Connections never migrate between workers.

use crate::cache::buffer::FillGuard;
use crate::cache::manager::CacheManager;
use crate::errors::{CacheError, HttpError, ReaderError, ServerError};
use crate::http::request::{HttpRequest, ReadStatus, WriteStatus};
use crate::http::types::{Method, RequestState};
use crate::limits::WorkerLimits;
use crate::reader::pool::{FileReaderPool, ReadDest, ReadOutcome, ReadRequest};
use crate::reader::stat::{FileKind, FileStat};
use crossbeam::channel::{unbounded, Receiver, Sender};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

// Short poll timeout so shutdown flags are observed with bounded latency
// even if a wake is missed.
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// The cache fill guard is the destination of a miss-fill read: the reader
/// thread writes through the held writer lock and commits the filled
/// length; dropping the guard afterwards releases the lock and the entry
/// reference.
impl ReadDest for FillGuard {
    fn capacity(&self) -> usize {
        FillGuard::capacity(self)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        FillGuard::bytes_mut(self)
    }

    fn commit(&mut self, used: usize) {
        FillGuard::commit(self, used)
    }
}

/// Reader-pool outcome for a connection parked in `WaitingForBody`.
struct FillDone {
    key: usize,
    result: Result<usize, ReaderError>,
}

struct Inbox {
    incoming: Vec<std::net::TcpStream>,
    active: usize,
    running: bool,
    shutdown: bool,
    abort: bool,
}

struct WorkerShared {
    static_root: String,
    limits: WorkerLimits,
    cache: Arc<CacheManager>,
    pool: Arc<FileReaderPool>,
    inbox: Mutex<Inbox>,
    waker: Arc<Waker>,
    fills_tx: Sender<FillDone>,
    fills_rx: Receiver<FillDone>,
}

pub struct Worker {
    shared: Arc<WorkerShared>,
    poll: Option<Poll>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Creates a worker bound to the shared cache and reader pool. The
    /// static root keeps no trailing slash so prefixed paths stay clean.
    pub(crate) fn new(
        static_root: &str,
        limits: WorkerLimits,
        cache: Arc<CacheManager>,
        pool: Arc<FileReaderPool>,
    ) -> Result<Self, ServerError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (fills_tx, fills_rx) = unbounded();

        let static_root = static_root.trim_end_matches('/').to_string();

        Ok(Self {
            shared: Arc::new(WorkerShared {
                static_root,
                limits,
                cache,
                pool,
                inbox: Mutex::new(Inbox {
                    incoming: Vec::new(),
                    active: 0,
                    running: false,
                    shutdown: false,
                    abort: false,
                }),
                waker,
                fills_tx,
                fills_rx,
            }),
            poll: Some(poll),
            thread: None,
        })
    }

    /// Hands a non-blocking client socket to this worker.
    pub fn add_request(&self, stream: std::net::TcpStream) -> Result<(), ServerError> {
        {
            let mut inbox = self.shared.inbox.lock();
            if inbox.shutdown {
                warn!("worker shutting down, rejecting connection");
                return Err(ServerError::WorkerShutdown);
            }
            if inbox.active >= self.shared.limits.max_requests {
                warn!(
                    active = inbox.active,
                    limit = self.shared.limits.max_requests,
                    "worker connection limit reached, rejecting"
                );
                return Err(ServerError::MaxRequestsExceeded);
            }
            inbox.incoming.push(stream);
            inbox.active += 1;
        }
        let _ = self.shared.waker.wake();
        Ok(())
    }

    /// Spawns the event-loop thread.
    pub fn start(&mut self) -> Result<(), ServerError> {
        {
            let mut inbox = self.shared.inbox.lock();
            if inbox.running {
                warn!("worker already running");
                return Err(ServerError::AlreadyRunning);
            }
            inbox.running = true;
        }

        let poll = self.poll.take().ok_or(ServerError::AlreadyRunning)?;
        let shared = self.shared.clone();
        self.thread = Some(
            thread::Builder::new()
                .name("worker".to_string())
                .spawn(move || worker_loop(&shared, poll))
                .map_err(ServerError::Io)?,
        );

        info!("worker thread started");
        Ok(())
    }

    /// Abrupt shutdown: live connections are dropped without a response.
    pub fn shutdown(&mut self) -> Result<(), ServerError> {
        self.stop(true)
    }

    /// Graceful shutdown: in-flight requests finish naturally, then the
    /// thread exits and is joined.
    pub fn graceful_shutdown(&mut self) -> Result<(), ServerError> {
        self.stop(false)
    }

    fn stop(&mut self, abort: bool) -> Result<(), ServerError> {
        {
            let mut inbox = self.shared.inbox.lock();
            if !inbox.running {
                return Err(ServerError::NotRunning);
            }
            inbox.shutdown = true;
            inbox.abort |= abort;
        }
        let _ = self.shared.waker.wake();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }
        self.shared.inbox.lock().running = false;

        info!("worker stopped");
        Ok(())
    }
}

fn worker_loop(shared: &WorkerShared, mut poll: Poll) {
    let mut events = Events::with_capacity(256);
    let mut connections: Slab<HttpRequest> = Slab::new();
    info!("worker loop started");

    loop {
        // Intake: register new connections, observe shutdown flags.
        let (shutdown, abort) = {
            let mut inbox = shared.inbox.lock();
            let incoming: Vec<std::net::TcpStream> = inbox.incoming.drain(..).collect();
            let flags = (inbox.shutdown, inbox.abort);
            drop(inbox);

            for stream in incoming {
                let mut request = HttpRequest::new(mio::net::TcpStream::from_std(stream));
                let entry = connections.vacant_entry();
                let token = Token(entry.key());
                match poll
                    .registry()
                    .register(request.stream_mut(), token, Interest::READABLE)
                {
                    Ok(()) => {
                        request.set_state(RequestState::Read);
                        debug!(key = token.0, "connection registered");
                        entry.insert(request);
                    }
                    Err(err) => {
                        warn!(%err, "failed to register connection");
                        shared.inbox.lock().active -= 1;
                    }
                }
            }
            flags
        };

        if abort {
            let dropped = connections.len();
            connections.clear();
            if dropped > 0 {
                let mut inbox = shared.inbox.lock();
                inbox.active -= dropped;
                warn!(dropped, "worker aborting with live connections");
            }
            break;
        }
        if shutdown && connections.is_empty() {
            break;
        }

        // Reader-pool completions for parked connections.
        while let Ok(done) = shared.fills_rx.try_recv() {
            apply_fill(shared, &poll, &mut connections, done);
        }

        if let Err(err) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(%err, "poll failed, worker exiting");
            break;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let Some(request) = connections.get_mut(token.0) else {
                continue;
            };

            if event.is_readable() && request.state() == RequestState::Read {
                handle_read(shared, &poll, token, request);
            }
            if event.is_writable() && request.state() == RequestState::Write {
                handle_write(token, request);
            }
        }

        // Reap finished connections; dropping the request closes the
        // socket and releases any body handle.
        let finished: Vec<usize> = connections
            .iter()
            .filter(|(_, request)| {
                matches!(request.state(), RequestState::Done | RequestState::Error)
            })
            .map(|(key, _)| key)
            .collect();
        for key in finished {
            let mut request = connections.remove(key);
            let _ = poll.registry().deregister(request.stream_mut());
            shared.inbox.lock().active -= 1;
            debug!(key, state = ?request.state(), "connection closed");
        }
    }

    info!("worker loop exited");
}

fn handle_read(shared: &WorkerShared, poll: &Poll, token: Token, request: &mut HttpRequest) {
    match request.read() {
        ReadStatus::End => {
            debug!(key = token.0, "request head complete");
            plan(shared, poll, token, request);
        }
        ReadStatus::NonBlocked => {}
        ReadStatus::Closed | ReadStatus::Error => {
            debug!(key = token.0, "read failed");
            request.set_state(RequestState::Error);
        }
    }
}

fn handle_write(token: Token, request: &mut HttpRequest) {
    match request.write() {
        WriteStatus::End => {
            debug!(key = token.0, "response written");
            request.set_state(RequestState::Done);
        }
        WriteStatus::NonBlocked => {}
        WriteStatus::Error => {
            debug!(key = token.0, "write failed");
            request.set_state(RequestState::Error);
        }
    }
}

/// Runs once per request after the header terminator arrives: parse,
/// resolve the path under the static root, stat, then serve from cache or
/// start a miss-fill.
fn plan(shared: &WorkerShared, poll: &Poll, token: Token, request: &mut HttpRequest) {
    match request.parse() {
        Ok(()) => {}
        Err(HttpError::UnsupportedMethod | HttpError::UnsupportedVersion) => {
            warn!(key = token.0, "unsupported method or version");
            request.prepare_method_not_allowed();
            to_write(poll, token, request);
            return;
        }
        Err(err) => {
            warn!(key = token.0, %err, "parse failed");
            request.set_state(RequestState::Error);
            return;
        }
    }

    let (method, is_root) = {
        let Some(parsed) = request.parsed() else {
            request.set_state(RequestState::Error);
            return;
        };
        (parsed.method, parsed.path == "/")
    };

    if is_root && request.replace_path("/index.html").is_err() {
        request.set_state(RequestState::Error);
        return;
    }

    // `..` segments would escape the document root.
    let traversal = request
        .parsed()
        .is_some_and(|parsed| parsed.path.split('/').any(|segment| segment == ".."));
    if traversal {
        warn!(key = token.0, "path traversal rejected");
        request.prepare_forbidden();
        to_write(poll, token, request);
        return;
    }

    if request.prefix_path(&shared.static_root).is_err() {
        request.set_state(RequestState::Error);
        return;
    }
    let Some(path) = request.parsed().map(|parsed| parsed.path.clone()) else {
        request.set_state(RequestState::Error);
        return;
    };
    debug!(key = token.0, %path, "resolved request path");

    let stat = match FileStat::probe(Path::new(&path)) {
        Ok(stat) => stat,
        Err(ReaderError::FileNotFound) => {
            debug!(key = token.0, %path, "file not found");
            request.prepare_not_found();
            to_write(poll, token, request);
            return;
        }
        Err(err) => {
            warn!(key = token.0, %path, %err, "stat failed");
            request.set_state(RequestState::Error);
            return;
        }
    };
    if stat.kind != FileKind::Regular {
        debug!(key = token.0, %path, "not a regular file");
        request.prepare_forbidden();
        to_write(poll, token, request);
        return;
    }

    if request.fill_response_header(&stat).is_err() {
        request.set_state(RequestState::Error);
        return;
    }

    if method == Method::Head {
        finish_ok(poll, token, request);
        return;
    }

    if let Some(handle) = shared.cache.read_handle(&path) {
        debug!(key = token.0, %path, "cache hit");
        if request.add_body(handle).is_err() {
            request.set_state(RequestState::Error);
            return;
        }
        finish_ok(poll, token, request);
        return;
    }

    debug!(key = token.0, %path, "cache miss");
    start_fill(shared, poll, token, request, &path, &stat);
}

/// Miss path: admit a cache entry, take the writer lock, and queue the
/// asynchronous fill. The connection parks in `WaitingForBody` until the
/// completion arrives over the channel.
fn start_fill(
    shared: &WorkerShared,
    poll: &Poll,
    token: Token,
    request: &mut HttpRequest,
    path: &str,
    stat: &FileStat,
) {
    match shared.cache.create(path, stat.len as usize) {
        Ok(()) => {}
        Err(CacheError::DuplicateKey) => {
            // Lost the miss race; the winner holds the writer lock while
            // it fills, so serving proceeds as a hit and the body write
            // blocks briefly on that lock.
            debug!(key = token.0, path, "concurrent fill in progress");
            match shared.cache.read_handle(path) {
                Some(handle) => {
                    if request.add_body(handle).is_err() {
                        request.set_state(RequestState::Error);
                        return;
                    }
                    finish_ok(poll, token, request);
                }
                None => request.set_state(RequestState::Error),
            }
            return;
        }
        Err(err) => {
            warn!(key = token.0, path, %err, "cache admission failed");
            request.set_state(RequestState::Error);
            return;
        }
    }

    let Some(write) = shared.cache.write_handle(path) else {
        request.set_state(RequestState::Error);
        return;
    };
    let Some(read) = shared.cache.read_handle(path) else {
        request.set_state(RequestState::Error);
        return;
    };
    if request.add_body(read).is_err() {
        request.set_state(RequestState::Error);
        return;
    }

    // Writer lock held from here until the reader pool settles the fill.
    let fill = write.into_fill();

    let fills_tx = shared.fills_tx.clone();
    let waker = shared.waker.clone();
    let key = token.0;
    let callback = Box::new(move |outcome: ReadOutcome| {
        let _ = fills_tx.send(FillDone {
            key,
            result: outcome.result,
        });
        let _ = waker.wake();
    });

    match shared.pool.queue(ReadRequest {
        path: PathBuf::from(path),
        dest: Box::new(fill),
        callback,
    }) {
        Ok(request_id) => {
            debug!(key = token.0, path, %request_id, "fill queued");
            request.set_state(RequestState::WaitingForBody);
        }
        Err(err) => {
            warn!(key = token.0, path, %err, "failed to queue fill");
            // The queue dropped the fill guard; release our body pin and
            // delete the stillborn entry.
            drop(request.take_body());
            if let Err(err) = shared.cache.remove(path) {
                warn!(path, %err, "stillborn cache entry left in place");
            }
            request.set_state(RequestState::Error);
        }
    }
}

/// Applies a reader-pool outcome to a parked connection.
fn apply_fill(
    shared: &WorkerShared,
    poll: &Poll,
    connections: &mut Slab<HttpRequest>,
    done: FillDone,
) {
    let Some(request) = connections.get_mut(done.key) else {
        return;
    };
    if request.state() != RequestState::WaitingForBody {
        return;
    }

    match done.result {
        Ok(bytes_read) => {
            debug!(key = done.key, bytes_read, "fill complete");
            finish_ok(poll, Token(done.key), request);
        }
        Err(err) => {
            warn!(key = done.key, %err, "fill failed");
            // Drop our pin and delete the empty entry so later requests
            // re-stat instead of serving a truncated body.
            if let Some(handle) = request.take_body() {
                let key = handle.key().to_string();
                drop(handle);
                if let Err(err) = shared.cache.remove(&key) {
                    warn!(%key, %err, "failed cache entry left in place");
                }
            }
            request.prepare_forbidden();
            to_write(poll, Token(done.key), request);
        }
    }
}

fn finish_ok(poll: &Poll, token: Token, request: &mut HttpRequest) {
    if request.prepare_ok().is_err() {
        request.set_state(RequestState::Error);
        return;
    }
    to_write(poll, token, request);
}

/// Transitions to `Write` and re-arms readiness for writability; the
/// re-registration delivers an immediate event if the socket is already
/// writable.
fn to_write(poll: &Poll, token: Token, request: &mut HttpRequest) {
    request.set_state(RequestState::Write);
    if poll
        .registry()
        .reregister(request.stream_mut(), token, Interest::WRITABLE)
        .is_err()
    {
        request.set_state(RequestState::Error);
    }
}
