//! One-shot metadata probe on a path or an open file.

use crate::errors::ReaderError;
use std::fs::{File, Metadata};
use std::io;
use std::path::Path;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Other,
}

/// The few facts the pipeline needs about a file: length for the cache
/// buffer and `Content-Length`, modification time for `Last-Modified`,
/// and the kind for the regular-file check.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub len: u64,
    pub modified: SystemTime,
    pub kind: FileKind,
}

impl FileStat {
    /// Stats `path`, following symlinks.
    pub fn probe(path: &Path) -> Result<Self, ReaderError> {
        std::fs::metadata(path)
            .map(Self::from_metadata)
            .map_err(map_stat_error)
    }

    /// Stats an already-open file.
    pub fn probe_file(file: &File) -> Result<Self, ReaderError> {
        file.metadata()
            .map(Self::from_metadata)
            .map_err(map_stat_error)
    }

    fn from_metadata(meta: Metadata) -> Self {
        let kind = if meta.is_file() {
            FileKind::Regular
        } else if meta.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Other
        };

        Self {
            len: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            kind,
        }
    }
}

fn map_stat_error(err: io::Error) -> ReaderError {
    match err.kind() {
        io::ErrorKind::NotFound => ReaderError::FileNotFound,
        _ => ReaderError::ReadingFile(err),
    }
}
