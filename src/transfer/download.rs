//! File download: storage to HTTP response

use super::{select_strategy, session_id, Strategy};
use crate::buffer::BufferPool;
use crate::context::ServerContext;
use crate::error::{SendError, StorageError, TransferError};
use crate::http::{content_type_for, ResponseSink, Status};
use crate::status::{FileOperation, StatusReporter};
use crate::storage::{Storage, StorageFile};
use crate::worker::{IoWorker, Outcome, SpawnFailure, WorkerStats};
use std::io::{self, Read};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// What to send and where to report it
pub struct DownloadTarget<'a> {
    pub storage: &'a dyn Storage,
    pub status: &'a dyn StatusReporter,
    /// Resolved location inside `storage`
    pub path: PathBuf,
    /// Request path, used for the content type and status display
    pub name: &'a str,
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub session: String,
    pub strategy: Strategy,
    /// Async was chosen but the worker could not be started
    pub fell_back: bool,
    pub size: u64,
    pub chunks: u64,
    pub bytes: u64,
    /// Set once the worker has acknowledged the terminal request
    pub worker: Option<WorkerStats>,
    /// Every scratch slot was back in the pool when the transfer ended
    pub buffers_reclaimed: bool,
}

/// Stream the file at `target.path` to `sink`.
///
/// Every failure is answered on `sink` before returning; the error is for
/// the caller's logs only.
pub fn download(
    ctx: &ServerContext,
    target: &DownloadTarget<'_>,
    sink: &mut dyn ResponseSink,
) -> Result<DownloadReport, TransferError> {
    if !target.storage.is_ready() {
        let _ = sink.send_error(Status::BadRequest, "Storage not ready");
        return Err(TransferError::StorageNotReady);
    }

    let size = match target.storage.stat(&target.path) {
        Ok(meta) if !meta.is_dir => meta.len,
        Ok(_) => {
            let _ = sink.send_error(Status::NotFound, "File does not exist");
            return Err(StorageError::NotFound(target.path.clone()).into());
        }
        Err(e) => {
            debug!(path = %target.path.display(), error = %e, "stat failed");
            let _ = sink.send_error(Status::NotFound, "File does not exist");
            return Err(e.into());
        }
    };

    let file = match target.storage.open_read(&target.path) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %target.path.display(), error = %e, "open for read failed");
            let _ = sink.send_error(Status::InternalServerError, "Failed to read existing file");
            return Err(e.into());
        }
    };

    let mut pool = match BufferPool::with_geometry(ctx.transfer.slot_count, ctx.transfer.slot_size)
    {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "scratch allocation failed");
            let _ = sink.send_error(Status::InternalServerError, "Out of memory");
            return Err(e.into());
        }
    };

    if let Err(e) = set_entity_headers(sink, target.name, size) {
        error!(error = %e, "failed to set content length");
        let _ = sink.send_error(Status::InternalServerError, "Failed to set content length");
        return Err(TransferError::Header(e));
    }

    let mut report = DownloadReport {
        session: session_id(),
        strategy: select_strategy(size, ctx.transfer.async_threshold),
        fell_back: false,
        size,
        chunks: 0,
        bytes: 0,
        worker: None,
        buffers_reclaimed: false,
    };
    info!(
        session = %report.session,
        path = %target.path.display(),
        size,
        strategy = ?report.strategy,
        "sending file"
    );
    target.status.notify(Some(target.name), FileOperation::Download);

    let result = match report.strategy {
        Strategy::Sync => stream_sync(file, &mut pool, sink, &mut report),
        Strategy::Async => {
            let name = format!("io-{}", report.session);
            match IoWorker::spawn(file, pool.slot_count(), &ctx.limiter, &name) {
                Ok(worker) => stream_async(worker, &mut pool, sink, &mut report),
                Err(SpawnFailure { error, file }) => {
                    warn!(session = %report.session, error = %error, "async setup failed; sending synchronously");
                    report.fell_back = true;
                    stream_sync(file, &mut pool, sink, &mut report)
                }
            }
        }
    };
    report.buffers_reclaimed = pool.is_complete();
    if !report.buffers_reclaimed {
        error!(
            session = %report.session,
            outstanding = pool.outstanding(),
            "scratch slots missing after transfer"
        );
    }
    target.status.notify(None, FileOperation::Idle);

    match result {
        Ok(()) => {
            sink.finish()?;
            info!(
                session = %report.session,
                chunks = report.chunks,
                bytes = report.bytes,
                "file sent"
            );
            Ok(report)
        }
        Err(e) => {
            error!(session = %report.session, error = %e, bytes = report.bytes, "file sending failed");
            abort(sink);
            Err(e)
        }
    }
}

fn set_entity_headers(
    sink: &mut dyn ResponseSink,
    name: &str,
    size: u64,
) -> Result<(), SendError> {
    sink.set_status(Status::Ok);
    sink.set_header("Content-Type", content_type_for(name))?;
    sink.set_header("Content-Length", &size.to_string())
}

/// End the response after a mid-transfer failure: a 500 if nothing went out
/// yet, otherwise just the terminating chunk.
fn abort(sink: &mut dyn ResponseSink) {
    let _ = sink.set_header("Content-Type", "text/plain");
    match sink.send_error(Status::InternalServerError, "Failed to send file") {
        Ok(()) => {}
        Err(SendError::HeadersSent) => {
            let _ = sink.finish();
        }
        Err(e) => debug!(error = %e, "could not report failure to peer"),
    }
}

fn stream_sync(
    mut file: Box<dyn StorageFile>,
    pool: &mut BufferPool,
    sink: &mut dyn ResponseSink,
    report: &mut DownloadReport,
) -> Result<(), TransferError> {
    let Some(mut slot) = pool.take() else {
        return Err(TransferError::ReadFailed);
    };
    let result = loop {
        let n = match read_retrying(&mut *file, slot.space_mut()) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => {
                warn!(session = %report.session, error = %e, "read failed");
                break Err(TransferError::ReadFailed);
            }
        };
        slot.set_len(n);
        if let Err(e) = sink.send_chunk(slot.filled()) {
            break Err(e.into());
        }
        report.chunks += 1;
        report.bytes += n as u64;
    };
    drop(file);
    if let Err(e) = pool.reclaim(slot) {
        error!(error = %e, "scratch slot reclaimed twice");
    }
    result
}

fn read_retrying(file: &mut dyn StorageFile, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match file.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Run the prefetch pipeline, then always perform the terminal handshake and
/// collect every slot before returning.
fn stream_async(
    worker: IoWorker,
    pool: &mut BufferPool,
    sink: &mut dyn ResponseSink,
    report: &mut DownloadReport,
) -> Result<(), TransferError> {
    let result = pump(&worker, pool, sink, report);
    let shutdown = worker.shutdown();
    for slot in shutdown.reclaimed {
        if let Err(e) = pool.reclaim(slot) {
            error!(error = %e, "scratch slot reclaimed twice");
        }
    }
    debug!(
        session = %report.session,
        reads = shutdown.stats.reads,
        faults = shutdown.stats.faults,
        "i/o worker stopped"
    );
    report.worker = Some(shutdown.stats);
    result
}

fn pump(
    worker: &IoWorker,
    pool: &mut BufferPool,
    sink: &mut dyn ResponseSink,
    report: &mut DownloadReport,
) -> Result<(), TransferError> {
    for slot in pool.take_all() {
        worker.submit_read(slot)?;
    }

    loop {
        let response = worker.next_response()?;
        if response.outcome == Outcome::Error || response.is_eof() {
            let failed = response.outcome == Outcome::Error;
            if let Err(e) = pool.reclaim(response.buffer) {
                error!(error = %e, "scratch slot reclaimed twice");
            }
            return if failed {
                Err(TransferError::ReadFailed)
            } else {
                Ok(())
            };
        }

        if let Err(e) = sink.send_chunk(response.buffer.filled()) {
            if let Err(e) = pool.reclaim(response.buffer) {
                error!(error = %e, "scratch slot reclaimed twice");
            }
            return Err(e.into());
        }
        report.chunks += 1;
        report.bytes += response.actual_length as u64;
        worker.submit_read(response.buffer)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::status::RecordingReporter;
    use crate::storage::LocalStorage;
    use crate::transfer::testing::{FaultyStorage, RecordingSink};
    use std::sync::Arc;
    use tempfile::TempDir;

    const MIB: usize = 1024 * 1024;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    struct Fixture {
        dir: TempDir,
        status: Arc<RecordingReporter>,
        ctx: ServerContext,
    }

    fn fixture(transfer: TransferConfig) -> Fixture {
        fixture_with(transfer, |_| {})
    }

    fn fixture_with(
        transfer: TransferConfig,
        configure: impl FnOnce(&mut FaultyStorage),
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FaultyStorage::new(LocalStorage::new(dir.path()).unwrap());
        configure(&mut storage);
        let status = Arc::new(RecordingReporter::default());
        let ctx = ServerContext::new(Arc::new(storage), status.clone(), transfer);
        Fixture { dir, status, ctx }
    }

    impl Fixture {
        fn put(&self, name: &str, data: &[u8]) {
            std::fs::write(self.dir.path().join(name), data).unwrap();
        }

        fn run(&self, name: &str, sink: &mut RecordingSink) -> Result<DownloadReport, TransferError> {
            let storage = self.ctx.storage.as_ref();
            let target = DownloadTarget {
                storage,
                status: self.status.as_ref(),
                path: storage.resolve(name).unwrap(),
                name,
            };
            download(&self.ctx, &target, sink)
        }
    }

    fn blank_report(strategy: Strategy) -> DownloadReport {
        DownloadReport {
            session: "test".to_string(),
            strategy,
            fell_back: false,
            size: 0,
            chunks: 0,
            bytes: 0,
            worker: None,
            buffers_reclaimed: false,
        }
    }

    #[test]
    fn large_file_streams_through_worker_in_order() {
        let fx = fixture(TransferConfig::default());
        let data = patterned(2 * MIB);
        fx.put("big.bin", &data);

        let mut sink = RecordingSink::default();
        let report = fx.run("big.bin", &mut sink).unwrap();

        assert_eq!(report.strategy, Strategy::Async);
        assert!(!report.fell_back);
        assert_eq!(report.chunks, 256);
        assert_eq!(sink.chunks.len(), 256);
        assert!(sink.chunks.iter().all(|c| c.len() == 8192));
        assert_eq!(sink.body(), data);
        assert_eq!(sink.header("Content-Length"), Some("2097152"));
        assert_eq!(sink.finished, 1);
        assert!(sink.error.is_none());

        let stats = report.worker.unwrap();
        assert!(stats.saw_terminal);
        assert!(report.buffers_reclaimed);
        assert_eq!(fx.ctx.limiter.active(), 0);
        assert_eq!(
            fx.status.events(),
            vec![
                (Some("big.bin".to_string()), FileOperation::Download),
                (None, FileOperation::Idle)
            ]
        );
    }

    #[test]
    fn strategy_boundary_is_inclusive() {
        let fx = fixture(TransferConfig::default());
        fx.put("at.bin", &patterned(MIB));
        fx.put("below.bin", &patterned(MIB - 1));

        let mut sink = RecordingSink::default();
        let at = fx.run("at.bin", &mut sink).unwrap();
        assert_eq!(at.strategy, Strategy::Async);
        assert_eq!(at.bytes, MIB as u64);

        let mut sink = RecordingSink::default();
        let below = fx.run("below.bin", &mut sink).unwrap();
        assert_eq!(below.strategy, Strategy::Sync);
        assert!(below.worker.is_none());
        assert_eq!(sink.body().len(), MIB - 1);
        assert_eq!(sink.finished, 1);
    }

    #[test]
    fn peer_failure_still_terminates_worker_and_reclaims_slots() {
        let fx = fixture(TransferConfig::default());
        fx.put("big.bin", &patterned(2 * MIB));

        let mut sink = RecordingSink::failing_after(1);
        let err = fx.run("big.bin", &mut sink).unwrap_err();
        assert!(matches!(err, TransferError::Send(_)));
        assert_eq!(sink.chunks.len(), 1);
        // Headers already went out, so only the terminating chunk follows
        assert_eq!(sink.finished, 1);
        assert_eq!(fx.status.count(FileOperation::Idle), 1);
        assert_eq!(fx.ctx.limiter.active(), 0);
    }

    #[test]
    fn worker_refusal_falls_back_to_sync() {
        let transfer = TransferConfig {
            max_workers: 0,
            ..TransferConfig::default()
        };
        let fx = fixture(transfer);
        let data = patterned(MIB + 17);
        fx.put("big.bin", &data);

        let mut sink = RecordingSink::default();
        let report = fx.run("big.bin", &mut sink).unwrap();
        assert_eq!(report.strategy, Strategy::Async);
        assert!(report.fell_back);
        assert!(report.worker.is_none());
        assert!(report.buffers_reclaimed);
        assert_eq!(sink.body(), data);
        assert_eq!(sink.finished, 1);
    }

    #[test]
    fn empty_file_ends_cleanly() {
        let transfer = TransferConfig {
            async_threshold: 1,
            ..TransferConfig::default()
        };
        let fx = fixture(transfer);
        fx.put("empty.txt", b"");

        let mut sink = RecordingSink::default();
        let report = fx.run("empty.txt", &mut sink).unwrap();
        assert_eq!(report.strategy, Strategy::Sync);
        assert_eq!(report.chunks, 0);
        assert_eq!(sink.header("Content-Length"), Some("0"));
        assert_eq!(sink.finished, 1);
        assert!(sink.error.is_none());
    }

    #[test]
    fn odd_sized_tail_arrives_intact() {
        let transfer = TransferConfig {
            async_threshold: 1024,
            ..TransferConfig::default()
        };
        let fx = fixture(transfer);
        let data = patterned(3 * 8192 + 100);
        fx.put("tail.bin", &data);

        let mut sink = RecordingSink::default();
        let report = fx.run("tail.bin", &mut sink).unwrap();
        assert_eq!(report.strategy, Strategy::Async);
        assert_eq!(report.chunks, 4);
        assert_eq!(sink.chunks.last().map(Vec::len), Some(100));
        assert_eq!(sink.body(), data);
        assert!(report.buffers_reclaimed);
    }

    #[test]
    fn missing_file_is_404_without_status_change() {
        let fx = fixture(TransferConfig::default());
        let mut sink = RecordingSink::default();
        let err = fx.run("nope.bin", &mut sink).unwrap_err();
        assert!(matches!(err, TransferError::Storage(StorageError::NotFound(_))));
        assert_eq!(
            sink.error,
            Some((Status::NotFound, "File does not exist".to_string()))
        );
        assert!(fx.status.events().is_empty());
    }

    #[test]
    fn directory_target_is_404() {
        let fx = fixture(TransferConfig::default());
        std::fs::create_dir(fx.dir.path().join("sub")).unwrap();
        let mut sink = RecordingSink::default();
        assert!(fx.run("sub", &mut sink).is_err());
        assert_eq!(sink.status, Some(Status::NotFound));
    }

    #[test]
    fn content_type_follows_extension() {
        let fx = fixture(TransferConfig::default());
        fx.put("doc.pdf", b"%PDF-1.4");
        let mut sink = RecordingSink::default();
        fx.run("doc.pdf", &mut sink).unwrap();
        assert_eq!(sink.header("Content-Type"), Some("application/pdf"));
    }

    #[test]
    fn peer_failure_returns_every_slot_to_the_pool() {
        let fx = fixture(TransferConfig::default());
        fx.put("big.bin", &patterned(2 * MIB));
        let storage = fx.ctx.storage.as_ref();
        let file = storage
            .open_read(&storage.resolve("big.bin").unwrap())
            .unwrap();

        let mut pool = BufferPool::with_geometry(3, 8192).unwrap();
        let worker = match IoWorker::spawn(file, pool.slot_count(), &fx.ctx.limiter, "io-test") {
            Ok(w) => w,
            Err(f) => panic!("worker did not start: {}", f.error),
        };
        let mut sink = RecordingSink::failing_after(1);
        let mut report = blank_report(Strategy::Async);

        let err = stream_async(worker, &mut pool, &mut sink, &mut report).unwrap_err();
        assert!(matches!(err, TransferError::Send(_)));
        assert_eq!(report.chunks, 1);
        assert!(pool.is_complete());
        assert_eq!(pool.available(), 3);
        assert!(report.worker.as_ref().is_some_and(|s| s.saw_terminal));
        assert_eq!(fx.ctx.limiter.active(), 0);
    }

    #[test]
    fn read_fault_before_first_chunk_is_500() {
        let fx = fixture_with(TransferConfig::default(), |s| s.read_limit = Some(0));
        fx.put("big.bin", &patterned(2 * MIB));

        let mut sink = RecordingSink::default();
        let err = fx.run("big.bin", &mut sink).unwrap_err();
        assert!(matches!(err, TransferError::ReadFailed));
        assert!(sink.chunks.is_empty());
        assert_eq!(
            sink.error,
            Some((Status::InternalServerError, "Failed to send file".to_string()))
        );
        assert_eq!(sink.finished, 0);
        assert_eq!(fx.status.count(FileOperation::Idle), 1);
        assert_eq!(fx.ctx.limiter.active(), 0);
    }

    #[test]
    fn read_fault_mid_stream_ends_with_terminating_chunk() {
        let fx = fixture_with(TransferConfig::default(), |s| s.read_limit = Some(2 * 8192));
        fx.put("big.bin", &patterned(2 * MIB));

        let mut sink = RecordingSink::default();
        let err = fx.run("big.bin", &mut sink).unwrap_err();
        assert!(matches!(err, TransferError::ReadFailed));
        assert_eq!(sink.chunks.len(), 2);
        assert!(sink.error.is_none());
        assert_eq!(sink.finished, 1);
        assert_eq!(fx.status.count(FileOperation::Idle), 1);
        assert_eq!(fx.ctx.limiter.active(), 0);
    }

    #[test]
    fn sync_read_fault_is_500() {
        let fx = fixture_with(TransferConfig::default(), |s| s.read_limit = Some(0));
        fx.put("small.txt", &patterned(10_000));

        let mut sink = RecordingSink::default();
        let err = fx.run("small.txt", &mut sink).unwrap_err();
        assert!(matches!(err, TransferError::ReadFailed));
        assert_eq!(sink.status, Some(Status::InternalServerError));
        assert_eq!(fx.status.count(FileOperation::Idle), 1);
    }

    #[test]
    fn storage_not_ready_refuses_download() {
        let fx = fixture_with(TransferConfig::default(), |s| s.ready = false);
        fx.put("a.txt", b"data");

        let mut sink = RecordingSink::default();
        let err = fx.run("a.txt", &mut sink).unwrap_err();
        assert!(matches!(err, TransferError::StorageNotReady));
        assert_eq!(
            sink.error,
            Some((Status::BadRequest, "Storage not ready".to_string()))
        );
        assert!(sink.chunks.is_empty());
        assert!(fx.status.events().is_empty());
    }
}
