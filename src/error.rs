//! Typed errors for the transfer pipeline and its collaborators

use std::io;
use std::path::PathBuf;

/// Failure to set up the asynchronous pipeline. Never fatal to a request:
/// callers degrade to synchronous I/O.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("invalid buffer geometry: {count} slots over {region} bytes")]
    InvalidGeometry { count: usize, region: usize },
    #[error("i/o worker is gone")]
    WorkerGone,
}

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("slot {0} is outside the pool")]
    OutOfRange(usize),
    #[error("slot {0} is already held by the pool")]
    AlreadyHeld(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{0} does not exist")]
    NotFound(PathBuf),
    #[error("{0} already exists")]
    AlreadyExists(PathBuf),
    #[error("path is too long ({0} bytes)")]
    NameTooLong(usize),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Classify an `io::Error` raised while touching `path`.
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(path),
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path),
            _ => StorageError::Io { path, source },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("response headers were already sent")]
    HeadersSent,
    #[error("response already finished")]
    Finished,
    #[error("peer write failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("receive timed out")]
    Timeout,
    #[error("peer closed the connection")]
    Closed,
    #[error("peer read failed: {0}")]
    Io(#[from] io::Error),
}

/// Why a request failed after (or while) responding to the client.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("storage not ready")]
    StorageNotReady,
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("storage read failed")]
    ReadFailed,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to set response header: {0}")]
    Header(SendError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Recv(#[from] RecvError),
    #[error("short write: {written}/{requested} bytes")]
    ShortWrite { written: usize, requested: usize },
}
