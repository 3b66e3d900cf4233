//! File upload and directory creation

use super::session_id;
use crate::buffer::BufferPool;
use crate::context::ServerContext;
use crate::error::{RecvError, StorageError, TransferError};
use crate::http::{BodySource, ResponseSink, Status};
use crate::status::FileOperation;
use crate::storage::StorageFile;
use crate::worker::write_counted;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub session: String,
    pub bytes: u64,
    /// Receive timeouts that were retried
    pub timeouts: u64,
}

/// Receive the request body into a new file at `path`.
///
/// The destination must not exist. Any failure after creation removes the
/// partial file. Every outcome is answered on `sink`.
pub fn upload(
    ctx: &ServerContext,
    name: &str,
    path: &Path,
    body: &mut dyn BodySource,
    sink: &mut dyn ResponseSink,
) -> Result<UploadReport, TransferError> {
    let storage = ctx.storage.as_ref();
    if !storage.is_ready() {
        let _ = sink.send_error(Status::BadRequest, "Storage not ready");
        return Err(TransferError::StorageNotReady);
    }

    let file = match storage.create_new(path) {
        Ok(f) => f,
        Err(e @ StorageError::AlreadyExists(_)) => {
            warn!(path = %path.display(), "file already exists");
            let _ = sink.send_error(Status::BadRequest, "File already exists");
            return Err(e.into());
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "create failed");
            let _ = sink.send_error(Status::InternalServerError, "Failed to create file");
            return Err(e.into());
        }
    };

    let mut report = UploadReport {
        session: session_id(),
        bytes: 0,
        timeouts: 0,
    };
    info!(
        session = %report.session,
        path = %path.display(),
        size = ?body.content_length(),
        "receiving file"
    );
    ctx.status.notify(Some(name), FileOperation::Upload);

    match receive_into(ctx, path, file, body, &mut report) {
        Ok(()) => {
            ctx.status.notify(None, FileOperation::Idle);
            info!(session = %report.session, bytes = report.bytes, "file received");
            sink.send_str(Status::Ok, "File uploaded successfully")?;
            Ok(report)
        }
        Err(e) => {
            error!(session = %report.session, error = %e, bytes = report.bytes, "file reception failed");
            if let Err(rm) = storage.remove_file(path) {
                warn!(path = %path.display(), error = %rm, "could not remove partial file");
            }
            ctx.status.notify(None, FileOperation::Idle);
            let message = match e {
                TransferError::Recv(_) => "Failed to receive file",
                TransferError::Setup(_) => "Out of memory",
                _ => "Failed to write file to storage",
            };
            let _ = sink.send_error(Status::InternalServerError, message);
            Err(e)
        }
    }
}

/// Copy the body into `file` through one scratch slot: the declared length
/// when there is one, otherwise everything up to the end of the body. The
/// file is closed before this returns.
fn receive_into(
    ctx: &ServerContext,
    path: &Path,
    mut file: Box<dyn StorageFile>,
    body: &mut dyn BodySource,
    report: &mut UploadReport,
) -> Result<(), TransferError> {
    let mut pool = BufferPool::with_geometry(1, ctx.transfer.slot_size)?;
    let Some(mut slot) = pool.take() else {
        return Err(TransferError::ReadFailed);
    };

    let mut remaining = body.content_length();
    loop {
        let want = match remaining {
            Some(0) => break,
            Some(left) => slot.capacity().min(usize::try_from(left).unwrap_or(usize::MAX)),
            None => slot.capacity(),
        };
        let received = match body.recv(&mut slot.space_mut()[..want]) {
            Ok(0) if remaining.is_none() => break,
            Ok(0) => return Err(RecvError::Closed.into()),
            Ok(n) => n,
            Err(RecvError::Timeout) => {
                report.timeouts += 1;
                debug!(session = %report.session, ?remaining, "receive timed out; retrying");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        slot.set_len(received);

        let (written, result) = write_counted(&mut *file, slot.filled());
        if let Err(e) = result {
            warn!(session = %report.session, error = %e, written, "storage write failed");
        }
        if written != received {
            return Err(TransferError::ShortWrite {
                written,
                requested: received,
            });
        }
        report.bytes += received as u64;
        if let Some(left) = remaining.as_mut() {
            *left -= received as u64;
        }
    }
    file.flush().map_err(|e| StorageError::from_io(path, e))?;
    Ok(())
}

/// Create a directory at `path` with fixed permissions.
pub fn create_directory(
    ctx: &ServerContext,
    path: &Path,
    sink: &mut dyn ResponseSink,
) -> Result<(), TransferError> {
    let storage = ctx.storage.as_ref();
    if !storage.is_ready() {
        let _ = sink.send_error(Status::BadRequest, "Storage not ready");
        return Err(TransferError::StorageNotReady);
    }
    match storage.create_dir(path) {
        Ok(()) => {
            info!(path = %path.display(), "directory created");
            sink.send_str(Status::Ok, "Directory created successfully")?;
            Ok(())
        }
        Err(e @ StorageError::AlreadyExists(_)) => {
            let _ = sink.send_error(Status::BadRequest, "Directory already exists");
            Err(e.into())
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "mkdir failed");
            let _ = sink.send_error(Status::InternalServerError, "Failed to create directory");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::status::RecordingReporter;
    use crate::storage::{LocalStorage, Storage};
    use crate::transfer::testing::{FaultyStorage, RecordingSink, ScriptedBody};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        status: Arc<RecordingReporter>,
        ctx: ServerContext,
    }

    fn fixture_with(configure: impl FnOnce(&mut FaultyStorage)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FaultyStorage::new(LocalStorage::new(dir.path()).unwrap());
        configure(&mut storage);
        let status = Arc::new(RecordingReporter::default());
        let ctx = ServerContext::new(Arc::new(storage), status.clone(), TransferConfig::default());
        Fixture { dir, status, ctx }
    }

    fn fixture(capacity: Option<usize>) -> Fixture {
        fixture_with(|s| s.write_limit = capacity)
    }

    impl Fixture {
        fn target(&self, name: &str) -> PathBuf {
            self.ctx.storage.resolve(name).unwrap()
        }
    }

    #[test]
    fn upload_writes_body_and_reports_success() {
        let fx = fixture(None);
        let data: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        let mut body = ScriptedBody::chunked(&data, 3000);
        let mut sink = RecordingSink::default();

        let path = fx.target("up.bin");
        let report = upload(&fx.ctx, "up.bin", &path, &mut body, &mut sink).unwrap();
        assert_eq!(report.bytes, data.len() as u64);
        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert_eq!(
            sink.error,
            Some((Status::Ok, "File uploaded successfully".to_string()))
        );
        assert_eq!(
            fx.status.events(),
            vec![
                (Some("up.bin".to_string()), FileOperation::Upload),
                (None, FileOperation::Idle)
            ]
        );
    }

    #[test]
    fn storage_full_midway_removes_partial_file() {
        let data = vec![0xA5u8; 64 * 1024];
        let fx = fixture(Some(data.len() / 2));
        let mut body = ScriptedBody::chunked(&data, 8192);
        let mut sink = RecordingSink::default();

        let path = fx.target("half.bin");
        let err = upload(&fx.ctx, "half.bin", &path, &mut body, &mut sink).unwrap_err();
        assert!(matches!(err, TransferError::ShortWrite { .. }));
        assert!(!path.exists());
        assert_eq!(
            sink.error,
            Some((
                Status::InternalServerError,
                "Failed to write file to storage".to_string()
            ))
        );
        assert_eq!(fx.status.count(FileOperation::Idle), 1);
    }

    #[test]
    fn receive_timeouts_are_retried() {
        let fx = fixture(None);
        let mut body = ScriptedBody::new(vec![
            Ok(b"hello ".to_vec()),
            Err(RecvError::Timeout),
            Err(RecvError::Timeout),
            Ok(b"world".to_vec()),
        ]);
        let mut sink = RecordingSink::default();

        let path = fx.target("slow.txt");
        let report = upload(&fx.ctx, "slow.txt", &path, &mut body, &mut sink).unwrap();
        assert_eq!(report.timeouts, 2);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn peer_disconnect_removes_partial_file() {
        let fx = fixture(None);
        let mut body = ScriptedBody::new(vec![Ok(vec![1u8; 100]), Err(RecvError::Closed)])
            .with_content_length(1000);
        let mut sink = RecordingSink::default();

        let path = fx.target("cut.bin");
        let err = upload(&fx.ctx, "cut.bin", &path, &mut body, &mut sink).unwrap_err();
        assert!(matches!(err, TransferError::Recv(RecvError::Closed)));
        assert!(!path.exists());
        assert_eq!(
            sink.error,
            Some((Status::InternalServerError, "Failed to receive file".to_string()))
        );
        assert_eq!(fx.status.count(FileOperation::Idle), 1);
    }

    #[test]
    fn existing_target_is_rejected_untouched() {
        let fx = fixture(None);
        std::fs::write(fx.dir.path().join("keep.txt"), b"kept").unwrap();
        let mut body = ScriptedBody::chunked(b"new", 3);
        let mut sink = RecordingSink::default();

        let path = fx.target("keep.txt");
        assert!(upload(&fx.ctx, "keep.txt", &path, &mut body, &mut sink).is_err());
        assert_eq!(
            sink.error,
            Some((Status::BadRequest, "File already exists".to_string()))
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"kept");
        assert!(fx.status.events().is_empty());
    }

    #[test]
    fn directory_creation() {
        let fx = fixture(None);
        let path = fx.target("photos");

        let mut sink = RecordingSink::default();
        create_directory(&fx.ctx, &path, &mut sink).unwrap();
        assert!(path.is_dir());
        assert_eq!(
            sink.error,
            Some((Status::Ok, "Directory created successfully".to_string()))
        );

        let mut sink = RecordingSink::default();
        assert!(create_directory(&fx.ctx, &path, &mut sink).is_err());
        assert_eq!(sink.status, Some(Status::BadRequest));
    }

    #[test]
    fn unsized_body_runs_to_its_end() {
        let fx = fixture(None);
        let mut body = ScriptedBody::new(vec![
            Ok(b"hel".to_vec()),
            Ok(b"lo".to_vec()),
        ])
        .r#unsized();
        let mut sink = RecordingSink::default();

        let path = fx.target("chunked.txt");
        let report = upload(&fx.ctx, "chunked.txt", &path, &mut body, &mut sink).unwrap();
        assert_eq!(report.bytes, 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert_eq!(sink.status, Some(Status::Ok));
    }

    #[test]
    fn body_ending_before_declared_length_is_a_disconnect() {
        let fx = fixture(None);
        let mut body = ScriptedBody::chunked(b"abc", 3).with_content_length(10);
        let mut sink = RecordingSink::default();

        let path = fx.target("short.bin");
        let err = upload(&fx.ctx, "short.bin", &path, &mut body, &mut sink).unwrap_err();
        assert!(matches!(err, TransferError::Recv(RecvError::Closed)));
        assert!(!path.exists());
    }

    #[test]
    fn storage_not_ready_refuses_upload_and_mkdir() {
        let fx = fixture_with(|s| s.ready = false);
        let mut body = ScriptedBody::chunked(b"data", 4);
        let mut sink = RecordingSink::default();

        let path = fx.target("late.txt");
        let err = upload(&fx.ctx, "late.txt", &path, &mut body, &mut sink).unwrap_err();
        assert!(matches!(err, TransferError::StorageNotReady));
        assert_eq!(
            sink.error,
            Some((Status::BadRequest, "Storage not ready".to_string()))
        );
        assert!(!path.exists());
        assert!(fx.status.events().is_empty());

        let mut sink = RecordingSink::default();
        let dir = fx.target("later");
        assert!(create_directory(&fx.ctx, &dir, &mut sink).is_err());
        assert_eq!(sink.status, Some(Status::BadRequest));
        assert!(!dir.exists());
    }
}
