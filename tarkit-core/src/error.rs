//! Error types for archive handle construction and teardown.

use std::collections::TryReserveError;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type used throughout `tarkit-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while opening, using, or closing an archive handle.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller asked for something the handle cannot represent, such as a
    /// combined read/write access mode.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage for the handle's bookkeeping table could not be obtained.
    #[error("failed to allocate {what}: {source}")]
    Allocation {
        what: &'static str,
        #[source]
        source: TryReserveError,
    },

    /// The bound backend reported a failure.
    #[error("backend {op} failed for '{}': {source}", .path.display())]
    Backend {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Create a new invalid argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new allocation error
    pub fn allocation(what: &'static str, source: TryReserveError) -> Self {
        Self::Allocation { what, source }
    }

    /// Create a new backend error for the operation `op` on `path`
    pub fn backend(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Backend {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Returns the underlying I/O error kind when the backend failed.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Backend { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}
