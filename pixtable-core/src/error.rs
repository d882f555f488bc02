use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Which table-file operation an I/O failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    OpenFailed,
    MmapFailed,
    ExtendFailed,
    WriteFailed,
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IoKind::OpenFailed => "open failed",
            IoKind::MmapFailed => "mmap failed",
            IoKind::ExtendFailed => "extend failed",
            IoKind::WriteFailed => "write failed",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid image format: {0}")]
    InvalidFormat(String),

    #[error("{kind} on {}: {source}", .path.display())]
    Io {
        kind: IoKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sidecar schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("image drawing failed: {0}")]
    DrawFailed(String),
}

impl CacheError {
    pub fn io(kind: IoKind, path: impl AsRef<Path>, source: std::io::Error) -> CacheError {
        CacheError::Io {
            kind,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}
