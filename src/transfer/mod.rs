//! Transfer orchestration
//!
//! Downloads pick a strategy by file size: small files are streamed
//! synchronously through one scratch slot, large ones are prefetched by an
//! `IoWorker` through the whole slot pool. Uploads are always synchronous
//! since the client paces them.

pub mod download;
pub mod upload;

pub use download::{download, DownloadReport, DownloadTarget};
pub use upload::{create_directory, upload, UploadReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Sync,
    Async,
}

/// Files of `threshold` bytes or more go through the i/o worker.
pub fn select_strategy(size: u64, threshold: u64) -> Strategy {
    if size >= threshold {
        Strategy::Async
    } else {
        Strategy::Sync
    }
}

/// Short id used to correlate the log lines of one transfer
pub(crate) fn session_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
