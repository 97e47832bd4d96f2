//! memserve - concurrent HTTP/1.x static-file server with an in-memory
//! content cache.
//!
//! Optimized for repeated serves of the same files from a static document
//! root. The pipeline has three moving parts:
//!
//! - [`CacheManager`] - a keyed byte-buffer store with per-buffer
//!   reader/writer locks, reference counting, and approximate-LRU eviction
//!   that never touches in-use buffers.
//! - [`FileReaderPool`] - a bounded thread pool performing blocking file
//!   I/O off the request path, reporting results through callbacks, with
//!   cancellation and drain/abort shutdown modes.
//! - [`server::Worker`] - per-thread event loops driving many non-blocking
//!   connections through an explicit request state machine
//!   (`Connect → Read → [WaitingForBody] → Write → Done`).
//!
//! A GET flows: accept → worker → read until end of headers → parse →
//! resolve under the static root → stat → cache lookup. A hit attaches the
//! cached buffer and writes; a miss admits a cache entry, holds its writer
//! lock across an asynchronous reader-pool fill, and parks the connection
//! until the completion flips it to the write phase.
//!
//! # Quick start
//!
//! ```no_run
//! use memserve::{Server, ServerConfig};
//! use std::sync::atomic::AtomicBool;
//!
//! let config = ServerConfig {
//!     static_root: "public".into(),
//!     port: 8080,
//!     ..ServerConfig::default()
//! };
//!
//! let shutdown = AtomicBool::new(false);
//! let mut server = Server::bind(&config).expect("bind");
//! server.run(&shutdown).expect("serve");
//! ```
//!
//! The `memserve` binary wraps this with flag parsing and signal-driven
//! graceful shutdown; see `memserve --help`.

pub mod cache {
    pub(crate) mod buffer;
    pub(crate) mod manager;

    pub use self::buffer::{BodyGuard, FillGuard, ReadHandle, WriteGuard, WriteHandle};
    pub use self::manager::CacheManager;
}

pub mod http {
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;

    pub use self::request::ParsedRequest;
    pub use self::types::{Method, RequestState, Version};
}

pub mod reader {
    pub(crate) mod pool;
    pub(crate) mod stat;

    pub use self::pool::{
        FileReaderPool, PoolStats, ReadCallback, ReadDest, ReadOutcome, ReadRequest,
    };
    pub use self::stat::{FileKind, FileStat};
}

pub mod server {
    pub(crate) mod server;
    pub(crate) mod worker;

    pub use self::server::Server;
    pub use self::worker::Worker;
}

pub mod errors;
pub mod limits;

pub use crate::{
    cache::CacheManager,
    errors::{CacheError, HttpError, ReaderError, ServerError},
    limits::ServerConfig,
    reader::FileReaderPool,
    server::Server,
};
