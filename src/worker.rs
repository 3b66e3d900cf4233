//! Background I/O worker for asynchronous transfers
//!
//! One worker thread is spawned per asynchronous transfer. It takes exclusive
//! ownership of the file handle and services `IoRequest`s from a bounded
//! request queue, answering each with exactly one `IoResponse` on a bounded
//! response queue. Faults are returned as data (`Outcome::Error`); the worker
//! itself only stops on the terminal request.
//!
//! Queue sizing: the request queue holds N data requests plus the terminal
//! request, the response queue holds N. With N slots in circulation neither
//! the terminal send nor the worker's final responses can block forever.

use crate::buffer::BufferSlot;
use crate::error::SetupError;
use crate::storage::StorageFile;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Error,
}

#[derive(Debug)]
pub enum IoRequest {
    Transfer {
        buffer: BufferSlot,
        requested_length: usize,
        op: IoOp,
    },
    /// Close the file handle and exit. Carries no buffer.
    Terminal,
}

#[derive(Debug)]
pub struct IoResponse {
    pub buffer: BufferSlot,
    pub actual_length: usize,
    pub op: IoOp,
    pub outcome: Outcome,
}

impl IoResponse {
    /// A clean zero-byte read
    pub fn is_eof(&self) -> bool {
        self.op == IoOp::Read && self.outcome == Outcome::Ok && self.actual_length == 0
    }
}

/// Counters returned by the worker thread when it exits
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub reads: u64,
    pub writes: u64,
    pub faults: u64,
    pub bytes: u64,
    /// false if the worker exited because the request queue disconnected
    pub saw_terminal: bool,
}

/// Caps how many I/O workers may run at once.
#[derive(Debug)]
pub struct WorkerLimiter {
    active: AtomicUsize,
    max: usize,
}

impl WorkerLimiter {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(WorkerLimiter {
            active: AtomicUsize::new(0),
            max,
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<WorkerPermit> {
        let mut cur = self.active.load(Ordering::Acquire);
        loop {
            if cur >= self.max {
                return None;
            }
            match self.active.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(WorkerPermit {
                        limiter: Arc::clone(self),
                    })
                }
                Err(actual) => cur = actual,
            }
        }
    }
}

/// Released when dropped
#[derive(Debug)]
pub struct WorkerPermit {
    limiter: Arc<WorkerLimiter>,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.limiter.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Worker creation failed; the caller gets its file handle back.
pub struct SpawnFailure {
    pub error: SetupError,
    pub file: Box<dyn StorageFile>,
}

/// What the orchestrator gets back from the terminal handshake
#[derive(Debug)]
pub struct Shutdown {
    pub stats: WorkerStats,
    /// Slots that were still sitting in the response queue
    pub reclaimed: Vec<BufferSlot>,
}

/// Handle to a running worker. Dropping it without `shutdown` still performs
/// the terminal handshake.
pub struct IoWorker {
    requests: SyncSender<IoRequest>,
    responses: Receiver<IoResponse>,
    handle: Option<JoinHandle<WorkerStats>>,
    _permit: WorkerPermit,
}

impl IoWorker {
    /// Spawn a worker for `slots` buffers and hand it `file`.
    ///
    /// The file is only moved into the worker once the thread exists, so a
    /// failed spawn returns it untouched for the synchronous fallback.
    pub fn spawn(
        file: Box<dyn StorageFile>,
        slots: usize,
        limiter: &Arc<WorkerLimiter>,
        name: &str,
    ) -> Result<Self, SpawnFailure> {
        let permit = match limiter.try_acquire() {
            Some(p) => p,
            None => {
                return Err(SpawnFailure {
                    error: SetupError::ResourceExhausted(format!(
                        "{} i/o workers already running",
                        limiter.max()
                    )),
                    file,
                })
            }
        };

        let (req_tx, req_rx) = mpsc::sync_channel::<IoRequest>(slots + 1);
        let (resp_tx, resp_rx) = mpsc::sync_channel::<IoResponse>(slots);
        let (file_tx, file_rx) = mpsc::sync_channel::<Box<dyn StorageFile>>(1);

        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || match file_rx.recv() {
                Ok(file) => run(file, req_rx, resp_tx),
                Err(_) => WorkerStats::default(),
            });

        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                return Err(SpawnFailure {
                    error: SetupError::ResourceExhausted(format!("spawn i/o worker: {e}")),
                    file,
                })
            }
        };

        if let Err(mpsc::SendError(file)) = file_tx.send(file) {
            // Thread died before taking the handle
            let _ = handle.join();
            return Err(SpawnFailure {
                error: SetupError::WorkerGone,
                file,
            });
        }

        Ok(IoWorker {
            requests: req_tx,
            responses: resp_rx,
            handle: Some(handle),
            _permit: permit,
        })
    }

    /// Queue a full-capacity read into `buffer`.
    pub fn submit_read(&self, buffer: BufferSlot) -> Result<(), SetupError> {
        let requested_length = buffer.capacity();
        self.submit(IoRequest::Transfer {
            buffer,
            requested_length,
            op: IoOp::Read,
        })
    }

    /// Queue a write of the bytes staged in `buffer`.
    pub fn submit_write(&self, buffer: BufferSlot) -> Result<(), SetupError> {
        let requested_length = buffer.len();
        self.submit(IoRequest::Transfer {
            buffer,
            requested_length,
            op: IoOp::Write,
        })
    }

    fn submit(&self, request: IoRequest) -> Result<(), SetupError> {
        self.requests
            .send(request)
            .map_err(|_| SetupError::WorkerGone)
    }

    /// Block until the worker answers the oldest outstanding request.
    pub fn next_response(&self) -> Result<IoResponse, SetupError> {
        self.responses.recv().map_err(|_| SetupError::WorkerGone)
    }

    /// Send the terminal request, wait for the worker to close the file and
    /// exit, then collect any responses it left behind.
    pub fn shutdown(mut self) -> Shutdown {
        let stats = self.terminate();
        let reclaimed = self.responses.try_iter().map(|r| r.buffer).collect();
        Shutdown { stats, reclaimed }
    }

    fn terminate(&mut self) -> WorkerStats {
        let Some(handle) = self.handle.take() else {
            return WorkerStats::default();
        };
        if self.requests.send(IoRequest::Terminal).is_err() {
            debug!("i/o worker already gone before terminal request");
        }
        match handle.join() {
            Ok(stats) => stats,
            Err(_) => {
                error!("i/o worker panicked");
                WorkerStats::default()
            }
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!("i/o worker dropped without shutdown; terminating");
            self.terminate();
        }
    }
}

fn run(
    mut file: Box<dyn StorageFile>,
    requests: Receiver<IoRequest>,
    responses: SyncSender<IoResponse>,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    loop {
        let (buffer, requested_length, op) = match requests.recv() {
            Ok(IoRequest::Terminal) => {
                stats.saw_terminal = true;
                break;
            }
            Ok(IoRequest::Transfer {
                buffer,
                requested_length,
                op,
            }) => (buffer, requested_length, op),
            Err(_) => {
                warn!("request queue disconnected without terminal request");
                break;
            }
        };

        let response = match op {
            IoOp::Read => read_into(&mut *file, buffer, requested_length),
            IoOp::Write => write_from(&mut *file, buffer, requested_length),
        };
        match response.op {
            IoOp::Read => stats.reads += 1,
            IoOp::Write => stats.writes += 1,
        }
        if response.outcome == Outcome::Error {
            stats.faults += 1;
        }
        stats.bytes += response.actual_length as u64;

        // Blocks while the response queue is full
        if responses.send(response).is_err() {
            debug!("response queue closed; buffer discarded");
        }
    }
    drop(file);
    stats
}

fn read_into(file: &mut dyn StorageFile, mut buffer: BufferSlot, requested: usize) -> IoResponse {
    let len = requested.min(buffer.capacity());
    let (actual_length, outcome) = match file.read(&mut buffer.space_mut()[..len]) {
        Ok(n) => (n, Outcome::Ok),
        Err(e) => {
            warn!(error = %e, "read failed");
            (0, Outcome::Error)
        }
    };
    buffer.set_len(actual_length);
    IoResponse {
        buffer,
        actual_length,
        op: IoOp::Read,
        outcome,
    }
}

fn write_from(file: &mut dyn StorageFile, buffer: BufferSlot, requested: usize) -> IoResponse {
    let len = requested.min(buffer.len());
    let (written, result) = write_counted(file, &buffer.filled()[..len]);
    let outcome = match result {
        Ok(()) if written == requested => Outcome::Ok,
        Ok(()) => Outcome::Error,
        Err(e) => {
            warn!(error = %e, written, requested, "write failed");
            Outcome::Error
        }
    };
    IoResponse {
        buffer,
        actual_length: written,
        op: IoOp::Write,
        outcome,
    }
}

/// `write_all` that also reports how far it got.
pub(crate) fn write_counted<W: Write + ?Sized>(
    file: &mut W,
    mut data: &[u8],
) -> (usize, io::Result<()>) {
    let mut written = 0;
    while !data.is_empty() {
        match file.write(data) {
            Ok(0) => {
                return (
                    written,
                    Err(io::Error::new(io::ErrorKind::WriteZero, "storage accepted 0 bytes")),
                )
            }
            Ok(n) => {
                written += n;
                data = &data[n..];
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return (written, Err(e)),
        }
    }
    (written, Ok(()))
}
