//! HTTP plumbing between `tiny_http` and the transfer handlers
//!
//! The handlers only see the `ResponseSink` and `BodySource` traits.
//! `ResponseWriter` streams a response over the raw connection writer of a
//! request, `Reply` buffers a short answer for `Request::respond`, and
//! `RequestBody` feeds an upload from the request body with a receive
//! timeout.

use crate::error::{RecvError, SendError};
use std::io::{self, Cursor, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Response, StatusCode};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::MethodNotAllowed => 405,
            Status::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        StatusCode(self.code()).default_reason_phrase()
    }
}

/// Outgoing half of a request, as seen by the transfer handlers.
pub trait ResponseSink {
    fn set_status(&mut self, status: Status);

    /// Fails once the head has gone out.
    fn set_header(&mut self, name: &str, value: &str) -> Result<(), SendError>;

    /// Send one body fragment. An empty fragment is ignored; use `finish` to
    /// end the body.
    fn send_chunk(&mut self, data: &[u8]) -> Result<(), SendError>;

    /// End the body (the terminating empty chunk).
    fn finish(&mut self) -> Result<(), SendError>;

    /// Complete short response with a plain-text body.
    fn send_str(&mut self, status: Status, body: &str) -> Result<(), SendError>;

    /// Error response with a human-readable message.
    fn send_error(&mut self, status: Status, message: &str) -> Result<(), SendError> {
        self.send_str(status, message)
    }
}

/// Incoming request body, as seen by the upload handler.
pub trait BodySource {
    /// Declared body length; `None` for a chunked body that runs until its
    /// terminating chunk.
    fn content_length(&self) -> Option<u64>;

    /// Receive up to `buf.len()` bytes. `Ok(0)` marks the end of the body.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecvError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Head not sent yet
    Pending,
    Chunked,
    Length { remaining: u64 },
    Done,
}

/// `ResponseSink` over any writer. When a `Content-Length` header is set the
/// body goes out raw; otherwise it is framed with chunked transfer encoding.
pub struct ResponseWriter<W: Write> {
    out: W,
    status: Status,
    headers: Vec<(String, String)>,
    framing: Framing,
    truncated: bool,
}

impl<W: Write> ResponseWriter<W> {
    pub fn new(out: W) -> Self {
        ResponseWriter {
            out,
            status: Status::Ok,
            headers: Vec::new(),
            framing: Framing::Pending,
            truncated: false,
        }
    }

    pub fn head_sent(&self) -> bool {
        self.framing != Framing::Pending
    }

    pub fn is_finished(&self) -> bool {
        self.framing == Framing::Done
    }

    /// The body ended short of its declared `Content-Length`.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn declared_length(&self) -> Option<u64> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse().ok())
    }

    fn write_head(&mut self) -> Result<(), SendError> {
        let framing = match self.declared_length() {
            Some(len) => Framing::Length { remaining: len },
            None => {
                self.headers
                    .push(("Transfer-Encoding".into(), "chunked".into()));
                Framing::Chunked
            }
        };
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.code(),
            self.status.reason()
        );
        for (k, v) in &self.headers {
            head.push_str(k);
            head.push_str(": ");
            head.push_str(v);
            head.push_str("\r\n");
        }
        head.push_str("Connection: close\r\n\r\n");
        // Mark the head as committed even if the write fails half-way
        self.framing = framing;
        self.out.write_all(head.as_bytes())?;
        Ok(())
    }
}

impl<W: Write> ResponseSink for ResponseWriter<W> {
    fn set_status(&mut self, status: Status) {
        if !self.head_sent() {
            self.status = status;
        }
    }

    fn set_header(&mut self, name: &str, value: &str) -> Result<(), SendError> {
        if self.head_sent() {
            return Err(SendError::HeadersSent);
        }
        if name.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
            return Err(SendError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "header contains control characters",
            )));
        }
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn send_chunk(&mut self, data: &[u8]) -> Result<(), SendError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.framing == Framing::Pending {
            self.write_head()?;
        }
        match self.framing {
            Framing::Chunked => {
                self.out.write_all(format!("{:x}\r\n", data.len()).as_bytes())?;
                self.out.write_all(data)?;
                self.out.write_all(b"\r\n")?;
            }
            Framing::Length { remaining } => {
                let len = data.len() as u64;
                if len > remaining {
                    return Err(SendError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "body exceeds declared Content-Length",
                    )));
                }
                self.out.write_all(data)?;
                self.framing = Framing::Length {
                    remaining: remaining - len,
                };
            }
            Framing::Done => return Err(SendError::Finished),
            Framing::Pending => unreachable!("head written above"),
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SendError> {
        if self.framing == Framing::Pending {
            if self.declared_length().is_none() {
                self.headers.push(("Content-Length".into(), "0".into()));
            }
            self.write_head()?;
        }
        match self.framing {
            Framing::Chunked => self.out.write_all(b"0\r\n\r\n")?,
            Framing::Length { remaining } if remaining > 0 => self.truncated = true,
            Framing::Done => return Err(SendError::Finished),
            _ => {}
        }
        self.framing = Framing::Done;
        self.out.flush()?;
        Ok(())
    }

    fn send_str(&mut self, status: Status, body: &str) -> Result<(), SendError> {
        if self.head_sent() {
            return Err(SendError::HeadersSent);
        }
        self.status = status;
        self.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));
        if !self
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        {
            self.headers
                .push(("Content-Type".into(), "text/plain".into()));
        }
        self.headers
            .push(("Content-Length".into(), body.len().to_string()));
        self.write_head()?;
        self.send_chunk(body.as_bytes())?;
        self.finish()
    }
}

enum Job {
    Write(Vec<u8>),
    Flush,
}

/// Writer that gives up on a peer that stops reading.
///
/// Writes are handed to a dedicated thread and each one must complete within
/// `timeout`. After the first timeout every call fails with `TimedOut`, so
/// the caller can release its resources; the sending thread stays parked on
/// the dead connection until the peer goes away.
pub struct TimedWriter {
    jobs: SyncSender<Job>,
    done: Receiver<(Vec<u8>, io::Result<()>)>,
    spare: Vec<u8>,
    timeout: Duration,
    stalled: bool,
}

impl TimedWriter {
    pub fn spawn(out: Box<dyn Write + Send>, timeout: Duration) -> io::Result<Self> {
        let (jobs, job_rx) = mpsc::sync_channel::<Job>(1);
        let (done_tx, done) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name("send".to_string())
            .spawn(move || drive(out, job_rx, done_tx))?;
        Ok(TimedWriter {
            jobs,
            done,
            spare: Vec::new(),
            timeout,
            stalled: false,
        })
    }

    /// A send has already timed out
    pub fn stalled(&self) -> bool {
        self.stalled
    }

    fn run(&mut self, job: Job) -> io::Result<()> {
        if self.stalled {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer stopped reading",
            ));
        }
        self.jobs
            .send(job)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "sender thread exited"))?;
        match self.done.recv_timeout(self.timeout) {
            Ok((buf, result)) => {
                if buf.capacity() > 0 {
                    self.spare = buf;
                }
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                self.stalled = true;
                warn!(timeout = ?self.timeout, "send timed out; abandoning connection");
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer stopped reading",
                ))
            }
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "sender thread exited",
            )),
        }
    }
}

impl Write for TimedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut buf = std::mem::take(&mut self.spare);
        buf.clear();
        buf.extend_from_slice(data);
        self.run(Job::Write(buf))?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.run(Job::Flush)
    }
}

fn drive(
    mut out: Box<dyn Write + Send>,
    jobs: Receiver<Job>,
    done: SyncSender<(Vec<u8>, io::Result<()>)>,
) {
    for job in jobs {
        let finished = match job {
            Job::Write(buf) => {
                let result = out.write_all(&buf);
                (buf, result)
            }
            Job::Flush => (Vec::new(), out.flush()),
        };
        if done.send(finished).is_err() {
            break;
        }
    }
    let _ = out.flush();
}

/// Buffered `ResponseSink` for short replies. Nothing reaches the peer until
/// `into_response` is handed to `Request::respond`.
#[derive(Debug, Default)]
pub struct Reply {
    status: Option<Status>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    committed: bool,
    finished: bool,
}

impl Reply {
    pub fn status(&self) -> Status {
        self.status.unwrap_or(Status::Ok)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_response(self) -> Response<Cursor<Vec<u8>>> {
        let code = self.status().code();
        let mut response = Response::from_data(self.body).with_status_code(code);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            match Header::from_bytes(name.as_bytes(), value.as_bytes()) {
                Ok(header) => response.add_header(header),
                Err(()) => debug!(name = %name, "dropping unrepresentable header"),
            }
        }
        response
    }
}

impl ResponseSink for Reply {
    fn set_status(&mut self, status: Status) {
        if !self.committed {
            self.status = Some(status);
        }
    }

    fn set_header(&mut self, name: &str, value: &str) -> Result<(), SendError> {
        if self.committed {
            return Err(SendError::HeadersSent);
        }
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn send_chunk(&mut self, data: &[u8]) -> Result<(), SendError> {
        if self.finished {
            return Err(SendError::Finished);
        }
        if !data.is_empty() {
            self.committed = true;
            self.body.extend_from_slice(data);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SendError> {
        if self.finished {
            return Err(SendError::Finished);
        }
        self.committed = true;
        self.finished = true;
        Ok(())
    }

    fn send_str(&mut self, status: Status, body: &str) -> Result<(), SendError> {
        if self.committed {
            return Err(SendError::HeadersSent);
        }
        self.status = Some(status);
        if !self
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        {
            self.headers
                .push(("Content-Type".into(), "text/plain".into()));
        }
        self.body = body.as_bytes().to_vec();
        self.committed = true;
        self.finished = true;
        Ok(())
    }
}

/// Upload body fed by a reader thread. The reader pulls `chunk_size` pieces
/// off the request; `recv` waits at most `timeout` for the next one and
/// reports `RecvError::Timeout` otherwise.
pub struct RequestBody {
    chunks: Receiver<io::Result<Vec<u8>>>,
    current: Vec<u8>,
    pos: usize,
    content_length: Option<u64>,
    timeout: Duration,
    ended: bool,
}

impl BodySource for RequestBody {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecvError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.current.len() {
            if self.ended {
                return Ok(0);
            }
            match self.chunks.recv_timeout(self.timeout) {
                Ok(Ok(chunk)) if chunk.is_empty() => {
                    self.ended = true;
                    return Ok(0);
                }
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(RecvError::Io(e)),
                Err(RecvTimeoutError::Timeout) => return Err(RecvError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(RecvError::Closed),
            }
        }
        let n = (self.current.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Run `f` with the body of `source` as a `BodySource`.
///
/// `open` yields the body reader (`Request::as_reader` for a live request).
/// The reader runs on a scoped thread that ends once the body is exhausted
/// or `f` has returned and dropped the body.
pub fn with_body<S, T>(
    source: &mut S,
    open: fn(&mut S) -> &mut dyn Read,
    content_length: Option<u64>,
    chunk_size: usize,
    timeout: Duration,
    f: impl FnOnce(&mut RequestBody) -> T,
) -> T
where
    S: Send,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::scope(|s| {
        let spawned = thread::Builder::new()
            .name("body".to_string())
            .spawn_scoped(s, move || pump_body(open(source), chunk_size.max(1), tx));
        if let Err(e) = spawned {
            warn!(error = %e, "could not start body reader");
        }
        let mut body = RequestBody {
            chunks: rx,
            current: Vec::new(),
            pos: 0,
            content_length,
            timeout,
            ended: false,
        };
        let out = f(&mut body);
        drop(body);
        out
    })
}

fn pump_body(reader: &mut dyn Read, chunk_size: usize, tx: SyncSender<io::Result<Vec<u8>>>) {
    loop {
        let mut chunk = vec![0u8; chunk_size];
        match reader.read(&mut chunk) {
            Ok(0) => {
                let _ = tx.send(Ok(Vec::new()));
                return;
            }
            Ok(n) => {
                chunk.truncate(n);
                if tx.send(Ok(chunk)).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        }
    }
}

/// Content type from the file extension; a limited set, plain text otherwise.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "html" => "text/html",
        "jpeg" | "jpg" => "image/jpeg",
        "ico" => "image/x-icon",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        _ => "text/plain",
    }
}
