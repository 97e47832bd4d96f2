use anyhow::Context;
use clap::Parser;
use memserve::limits::{parse_size, CacheLimits, ReaderLimits, ServerConfig, WorkerLimits};
use memserve::Server;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Concurrent HTTP/1.x static-file server with an in-memory content cache.
#[derive(Parser, Debug)]
#[command(name = "memserve", version)]
struct Args {
    /// Document root served to clients
    #[arg(short = 'r', long = "root", default_value = "data")]
    root: PathBuf,

    /// TCP port to listen on
    #[arg(short = 'p', long = "port", default_value_t = 8080)]
    port: u16,

    /// Total cache memory (k/m/g suffixes accepted)
    #[arg(short = 'c', long = "cache-size", value_parser = size_arg, default_value = "64m")]
    cache_size: usize,

    /// Maximum number of cached files
    #[arg(short = 'e', long = "max-entries", default_value_t = 1024)]
    max_entries: usize,

    /// Per-file cache ceiling (k/m/g suffixes accepted)
    #[arg(short = 's', long = "max-entry-size", value_parser = size_arg, default_value = "8m")]
    max_entry_size: usize,

    /// File-reader threads (defaults to the CPU count)
    #[arg(short = 'a', long = "readers")]
    readers: Option<usize>,

    /// Maximum concurrent requests per worker and queued file reads
    #[arg(short = 'm', long = "max-requests", default_value_t = 1024)]
    max_requests: usize,

    /// Worker threads (defaults to the CPU count)
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,
}

fn size_arg(value: &str) -> Result<usize, String> {
    parse_size(value).ok_or_else(|| format!("invalid size: {value:?}"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        static_root: args.root,
        port: args.port,
        worker_count: args.workers.unwrap_or_else(num_cpus::get),
        cache: CacheLimits {
            max_memory: args.cache_size,
            max_entries: args.max_entries,
            max_buffer_size: args.max_entry_size,
        },
        reader: ReaderLimits {
            max_requests: args.max_requests,
            worker_count: args.readers.unwrap_or_else(num_cpus::get),
        },
        worker: WorkerLimits {
            max_requests: args.max_requests,
        },
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM, SIGHUP, SIGQUIT] {
        signal_hook::flag::register(signal, shutdown.clone())
            .with_context(|| format!("registering signal {signal}"))?;
    }

    let mut server = Server::bind(&config).context("starting server")?;
    info!(port = config.port, root = %config.static_root.display(), "memserve listening");

    server.run(&shutdown).context("server loop")?;
    Ok(())
}
