//! Server configuration and tunable limits.
//!
//! Defaults are conservative: a cache bounded well below typical RAM, a
//! bounded reader queue, and per-worker connection ceilings that keep one
//! slow client population from starving the rest. Every knob maps to a
//! launcher flag (see `memserve --help`).
//!
//! # Examples
//!
//! ```
//! use memserve::limits::{CacheLimits, ServerConfig};
//!
//! let config = ServerConfig {
//!     port: 8088,
//!     cache: CacheLimits {
//!         max_memory: 256 * 1024 * 1024,
//!         ..CacheLimits::default()
//!     },
//!     ..ServerConfig::default()
//! };
//! assert_eq!(config.cache.max_entries, 1024);
//! ```

use std::path::PathBuf;

/// Bounds for the shared content cache.
#[derive(Debug, Clone)]
pub struct CacheLimits {
    /// Total bytes of cached file content across all entries
    /// (default: `64 MiB`). Admitting an entry past this bound evicts
    /// least-recently-used unreferenced entries, all-or-nothing.
    pub max_memory: usize,

    /// Maximum number of cached files (default: `1024`). Also sizes the
    /// hash table, so lookups stay O(1) amortized at the ceiling.
    pub max_entries: usize,

    /// Per-file ceiling (default: `8 MiB`). Larger files are never cached;
    /// requests for them fail rather than thrash the cache.
    pub max_buffer_size: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024,
            max_entries: 1024,
            max_buffer_size: 8 * 1024 * 1024,
        }
    }
}

/// Bounds for the asynchronous file-reader pool.
#[derive(Debug, Clone)]
pub struct ReaderLimits {
    /// Maximum queued-plus-in-flight read requests (default: `256`).
    /// `queue` fails fast once reached; callers answer the client with an
    /// error instead of piling up blocked reads.
    pub max_requests: usize,

    /// Number of reader threads performing blocking file I/O
    /// (default: `4`).
    pub worker_count: usize,
}

impl Default for ReaderLimits {
    fn default() -> Self {
        Self {
            max_requests: 256,
            worker_count: 4,
        }
    }
}

/// Per-worker connection bounds.
#[derive(Debug, Clone)]
pub struct WorkerLimits {
    /// Maximum concurrent connections owned by one worker
    /// (default: `1024`). `add_request` rejects beyond this and the
    /// dispatcher closes the socket.
    pub max_requests: usize,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self { max_requests: 1024 }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Document root all request targets resolve under (default: `data`).
    /// A trailing slash is stripped at worker creation.
    pub static_root: PathBuf,

    /// TCP port to listen on, IPv4 `INADDR_ANY` (default: `8080`).
    pub port: u16,

    /// Number of worker threads, each driving its own set of
    /// connections (default: `4`). Connections are dispatched round-robin;
    /// there is no work stealing.
    pub worker_count: usize,

    pub cache: CacheLimits,
    pub reader: ReaderLimits,
    pub worker: WorkerLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            static_root: PathBuf::from("data"),
            port: 8080,
            worker_count: 4,
            cache: CacheLimits::default(),
            reader: ReaderLimits::default(),
            worker: WorkerLimits::default(),
        }
    }
}

/// Parses a byte count with an optional case-insensitive `k`/`m`/`g`
/// suffix (factor 1024).
///
/// # Examples
///
/// ```
/// use memserve::limits::parse_size;
///
/// assert_eq!(parse_size("512"), Some(512));
/// assert_eq!(parse_size("4k"), Some(4096));
/// assert_eq!(parse_size("2M"), Some(2 * 1024 * 1024));
/// ```
pub fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (digits, factor) = match value.as_bytes()[value.len() - 1] {
        b'k' | b'K' => (&value[..value.len() - 1], 1024usize),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };

    let number: usize = digits.parse().ok()?;
    number.checked_mul(factor)
}
