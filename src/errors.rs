//! Error types for every component of the serving pipeline.
//!
//! All operations report failure through these enums; nothing in the
//! request path panics or propagates errors non-locally. A would-block
//! condition on a socket is not an error: it is the `NonBlocked` arm of
//! the read/write status enums, and the caller re-arms readiness.

use std::io;
use thiserror::Error;

/// Errors returned by [`CacheManager`](crate::cache::CacheManager)
/// operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The requested buffer is larger than the per-entry ceiling.
    #[error("buffer of {requested} bytes exceeds the {limit}-byte entry limit")]
    BufferSizeLimit { requested: usize, limit: usize },

    /// Admission would exceed `max_memory` and eviction could not cover
    /// the deficit. Nothing was evicted.
    #[error("cache memory limit exceeded")]
    MemoryLimitExceeded,

    /// The entry-count ceiling is reached and no entry is evictable.
    #[error("cache entry limit exceeded")]
    BufferCountExceeded,

    /// An entry with this key already exists.
    #[error("duplicate cache key")]
    DuplicateKey,

    /// No entry with this key.
    #[error("cache key not found")]
    KeyNotFound,

    /// The entry is pinned by outstanding handles.
    #[error("cache entry is still referenced")]
    BufferReferenced,

    /// Eviction could not free enough unreferenced entries.
    #[error("all candidate entries are in use")]
    BuffersUsed,
}

/// Errors produced by the [`FileReaderPool`](crate::reader::FileReaderPool)
/// and delivered through read callbacks.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// A required request field was empty or zero.
    #[error("invalid read request parameter")]
    InvalidParameter,

    /// The pool is shutting down and accepts no new requests.
    #[error("reader pool is shutting down")]
    Shutdown,

    /// The pending-request ceiling is reached.
    #[error("reader pool request limit reached")]
    MaxRequestsExceeded,

    /// No pending or in-flight request carries this id.
    #[error("read request not found")]
    RequestNotFound,

    /// The file does not exist.
    #[error("file not found")]
    FileNotFound,

    /// The path names something other than a regular file.
    #[error("not a regular file")]
    FileNotRegularFile,

    /// The file does not fit the destination buffer.
    #[error("file of {size} bytes exceeds the {capacity}-byte destination")]
    FileTooLarge { size: u64, capacity: usize },

    /// Opening or reading the file failed.
    #[error("reading file failed")]
    ReadingFile(#[source] io::Error),

    /// The request was canceled before completion.
    #[error("read request canceled")]
    Canceled,
}

/// Errors from parsing a request or assembling a response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpError {
    /// The request line or headers are malformed.
    #[error("malformed HTTP request")]
    Parse,

    /// The method is not `GET` or `HEAD`.
    #[error("unsupported HTTP method")]
    UnsupportedMethod,

    /// The version is not `HTTP/1.0` or `HTTP/1.1`.
    #[error("unsupported HTTP version")]
    UnsupportedVersion,

    /// The operation requires a successfully parsed request.
    #[error("request has not been parsed")]
    NotParsed,

    /// The operation requires response data to be filled first.
    #[error("response has not been prepared")]
    ResponseNotFilled,
}

/// Lifecycle and dispatch errors from [`Worker`](crate::server::Worker) and
/// [`Server`](crate::server::Server).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("already running")]
    AlreadyRunning,

    #[error("not running")]
    NotRunning,

    /// The worker refuses new connections while shutting down.
    #[error("worker is shutting down")]
    WorkerShutdown,

    /// The worker is at its connection ceiling.
    #[error("worker connection limit reached")]
    MaxRequestsExceeded,

    #[error(transparent)]
    Io(#[from] io::Error),
}
