//! The listening socket and the accept loop.
//!
//! One accept thread (the caller of [`Server::run`]) hands non-blocking
//! client sockets to the workers round-robin. The cache and the reader
//! pool are shared across all workers; their internal locks provide all
//! synchronization.

use crate::cache::manager::CacheManager;
use crate::errors::ServerError;
use crate::limits::ServerConfig;
use crate::reader::pool::FileReaderPool;
use crate::server::worker::Worker;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTEN_BACKLOG: i32 = 1000;
const ACCEPT_IDLE_SLEEP: Duration = Duration::from_millis(1);

pub struct Server {
    listener: TcpListener,
    workers: Vec<Worker>,
    cache: Arc<CacheManager>,
    pool: Arc<FileReaderPool>,
    next_worker: usize,
    running: bool,
}

impl Server {
    /// Binds the listener and builds the shared pipeline: cache, reader
    /// pool, and `worker_count` workers. Workers are not started until
    /// [`run`](Self::run).
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let listener = Self::make_listener(config.port)?;

        let cache = Arc::new(CacheManager::new(config.cache.clone()));
        let pool = Arc::new(FileReaderPool::new(config.reader.clone()));

        let static_root = config.static_root.to_string_lossy();
        let worker_count = config.worker_count.max(1);
        let workers = (0..worker_count)
            .map(|_| {
                Worker::new(
                    &static_root,
                    config.worker.clone(),
                    cache.clone(),
                    pool.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            port = config.port,
            workers = worker_count,
            root = %static_root,
            "server created"
        );

        Ok(Self {
            listener,
            workers,
            cache,
            pool,
            next_worker: 0,
            running: false,
        })
    }

    /// IPv4 `INADDR_ANY` listener: reuse-addr, backlog 1000, non-blocking.
    fn make_listener(port: u16) -> Result<TcpListener, ServerError> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        Ok(socket.into())
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared cache counters, for observability.
    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Starts the workers and accepts connections until `shutdown` is
    /// raised, then drains gracefully.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), ServerError> {
        if self.running {
            return Err(ServerError::AlreadyRunning);
        }
        for worker in &mut self.workers {
            worker.start()?;
        }
        self.running = true;
        info!("server started, accepting connections");

        while !shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "client connected");
                    self.dispatch(stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_IDLE_SLEEP);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    error!(%err, "accept failed, shutting down");
                    self.graceful_shutdown();
                    return Err(ServerError::Io(err));
                }
            }
        }

        info!("shutdown requested");
        self.graceful_shutdown();
        Ok(())
    }

    /// Round-robin dispatch; a rejected connection is closed.
    fn dispatch(&mut self, stream: TcpStream) {
        if let Err(err) = stream.set_nonblocking(true) {
            warn!(%err, "failed to set client socket non-blocking");
            return;
        }

        let index = self.next_worker;
        self.next_worker = (self.next_worker + 1) % self.workers.len();

        if let Err(err) = self.workers[index].add_request(stream) {
            warn!(worker = index, %err, "dispatch rejected, closing connection");
        }
    }

    /// Stops accepting, drains the reader pool, then stops every worker,
    /// letting in-flight requests finish.
    pub fn graceful_shutdown(&mut self) {
        if !self.running {
            return;
        }
        info!("graceful shutdown");
        self.pool.graceful_shutdown();
        for worker in &mut self.workers {
            let _ = worker.graceful_shutdown();
        }
        self.running = false;
        info!("server stopped");
    }

    /// Abrupt teardown: cancels reads and drops live connections.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        warn!("abrupt shutdown");
        self.pool.shutdown();
        for worker in &mut self.workers {
            let _ = worker.shutdown();
        }
        self.running = false;
    }
}
