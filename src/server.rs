//! HTTP front end: request loop and routing
//!
//! `tiny_http` accepts connections and parses requests; every request is
//! handled on its own thread.
//!
//! Routes:
//! - `GET /get/<path>` download, or a JSON listing when `<path>` ends in `/`
//! - `POST|PUT /upload/<path>` upload, or mkdir when `<path>` ends in `/`
//! - `DELETE|POST /delete/<path>` remove a file or empty directory
//! - `GET /<path>` static web UI

use crate::context::ServerContext;
use crate::error::StorageError;
use crate::http::{self, Reply, ResponseSink, ResponseWriter, Status, TimedWriter};
use crate::status::{FileOperation, NoopStatusReporter};
use crate::storage::Storage;
use crate::transfer::{self, DownloadTarget};
use anyhow::{anyhow, bail, Context, Result};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tiny_http::{Method, Request};
use tracing::{debug, error, info, warn};

/// Longest stretch the request loop goes without looking at the stop flag.
/// `StopHandle::stop` also wakes it directly.
const RECV_POLL: Duration = Duration::from_millis(500);

pub struct Server {
    http: Arc<tiny_http::Server>,
    ctx: Arc<ServerContext>,
    stop: StopHandle,
}

/// Makes a running `Server` stop taking requests, wait for the open ones
/// and return.
#[derive(Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    http: Arc<tiny_http::Server>,
}

impl StopHandle {
    /// Returns whether a stop had already been requested.
    pub fn stop(&self) -> bool {
        let already = self.requested.swap(true, Ordering::AcqRel);
        self.http.unblock();
        already
    }

    pub fn is_stopped(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl Server {
    pub fn bind(addr: &str, ctx: Arc<ServerContext>) -> Result<Self> {
        let http = tiny_http::Server::http(addr).map_err(|e| anyhow!("bind {}: {}", addr, e))?;
        let http = Arc::new(http);
        let stop = StopHandle {
            requested: Arc::new(AtomicBool::new(false)),
            http: Arc::clone(&http),
        };
        Ok(Server { http, ctx, stop })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.http
            .server_addr()
            .to_ip()
            .context("listener has no IP address")
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "file server listening");
        let mut open: Vec<JoinHandle<()>> = Vec::new();
        while !self.stop.is_stopped() {
            let request = match self.http.recv_timeout(RECV_POLL) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "failed to receive request");
                    continue;
                }
            };
            open.retain(|h| !h.is_finished());
            let name = match request.remote_addr() {
                Some(peer) => format!("conn-{}", peer.port()),
                None => "conn".to_string(),
            };
            let ctx = Arc::clone(&self.ctx);
            let spawned = thread::Builder::new()
                .name(name)
                .spawn(move || handle_request(request, &ctx));
            match spawned {
                Ok(h) => open.push(h),
                Err(e) => warn!(error = %e, "could not spawn request thread"),
            }
        }
        open.retain(|h| !h.is_finished());
        info!(active = open.len(), "shutting down; waiting for open requests");
        for h in open {
            let _ = h.join();
        }
        Ok(())
    }
}

/// Bind `addr` and serve until the process exits.
pub fn serve(addr: &str, ctx: Arc<ServerContext>) -> Result<()> {
    Server::bind(addr, ctx)?.run()
}

fn handle_request(request: Request, ctx: &ServerContext) {
    let method = request.method().clone();
    let path = request_path(request.url()).to_string();
    debug!(%method, %path, peer = ?request.remote_addr(), "request");
    if let Err(e) = route(ctx, request, &method, &path) {
        debug!(%path, error = %e, "request ended with error");
    }
}

/// Request target without its query string, still percent-encoded
fn request_path(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

fn route(ctx: &ServerContext, mut request: Request, method: &Method, path: &str) -> Result<()> {
    if let Some(rest) = strip_route(path, "/get") {
        if *method != Method::Get {
            return method_not_allowed(request);
        }
        return streamed(ctx, request, path, |out| {
            let rel = decode_or_reject(ctx, rest, out)?;
            if rel.ends_with('/') {
                return list_directory(ctx, &rel, out);
            }
            let path = resolve_or_reject(ctx.storage.as_ref(), &rel, out)?;
            let target = DownloadTarget {
                storage: ctx.storage.as_ref(),
                status: ctx.status.as_ref(),
                path,
                name: &rel,
            };
            transfer::download(ctx, &target, out)?;
            Ok(())
        });
    }

    if let Some(rest) = strip_route(path, "/upload") {
        if !matches!(method, Method::Post | Method::Put) {
            return method_not_allowed(request);
        }
        let mut out = Reply::default();
        let result = receive_upload(ctx, &mut request, rest, &mut out);
        respond(request, out)?;
        return result;
    }

    if let Some(rest) = strip_route(path, "/delete") {
        if !matches!(method, Method::Delete | Method::Post) {
            return method_not_allowed(request);
        }
        let mut out = Reply::default();
        let result = match decode_or_reject(ctx, rest, &mut out) {
            Ok(rel) => delete_entry(ctx, &rel, &mut out),
            Err(e) => Err(e),
        };
        respond(request, out)?;
        return result;
    }

    if *method != Method::Get {
        return method_not_allowed(request);
    }
    streamed(ctx, request, path, |out| serve_static(ctx, path, out))
}

/// Run `handler` against a response streamed on the raw connection. Every
/// send must complete within the configured send timeout.
fn streamed<F>(ctx: &ServerContext, request: Request, path: &str, handler: F) -> Result<()>
where
    F: FnOnce(&mut dyn ResponseSink) -> Result<()>,
{
    let writer = TimedWriter::spawn(request.into_writer(), ctx.transfer.send_timeout())
        .context("start response sender")?;
    let mut out = ResponseWriter::new(BufWriter::new(writer));
    let result = handler(&mut out);
    if out.truncated() {
        warn!(path, "response body cut short");
    }
    result
}

fn respond(request: Request, out: Reply) -> Result<()> {
    request
        .respond(out.into_response())
        .context("send reply")
}

fn method_not_allowed(request: Request) -> Result<()> {
    let mut out = Reply::default();
    out.send_error(Status::MethodNotAllowed, "Method not allowed")?;
    respond(request, out)
}

fn receive_upload(
    ctx: &ServerContext,
    request: &mut Request,
    rest: &str,
    out: &mut Reply,
) -> Result<()> {
    let rel = decode_or_reject(ctx, rest, out)?;
    let trimmed = rel.trim_end_matches('/');
    if trimmed.is_empty() {
        let _ = out.send_error(Status::BadRequest, "Invalid filename");
        bail!("upload target is the storage root");
    }
    let path = resolve_or_reject(ctx.storage.as_ref(), trimmed, out)?;
    if rel.ends_with('/') {
        transfer::create_directory(ctx, &path, out)?;
        return Ok(());
    }
    let content_length = request.body_length().map(|n| n as u64);
    http::with_body(
        request,
        Request::as_reader,
        content_length,
        ctx.transfer.slot_size,
        ctx.transfer.recv_timeout(),
        |body| transfer::upload(ctx, &rel, &path, body, out),
    )?;
    Ok(())
}

/// `Some(rest)` when `path` is `prefix` or lives under it; bare `prefix`
/// maps to `/`.
fn strip_route<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    match path.strip_prefix(prefix)? {
        "" => Some("/"),
        rest if rest.starts_with('/') => Some(rest),
        _ => None,
    }
}

/// Percent-decode a request path and enforce the length limit.
pub fn decode_request_path(encoded: &str, max_len: usize) -> Result<String, StorageError> {
    let decoded = percent_decode_str(encoded)
        .decode_utf8()
        .map_err(|_| StorageError::InvalidPath("path is not valid UTF-8".into()))?;
    if decoded.len() > max_len {
        return Err(StorageError::NameTooLong(decoded.len()));
    }
    Ok(decoded.into_owned())
}

fn decode_or_reject(ctx: &ServerContext, encoded: &str, out: &mut dyn ResponseSink) -> Result<String> {
    match decode_request_path(encoded, ctx.max_path_len) {
        Ok(p) => Ok(p),
        Err(e @ StorageError::NameTooLong(_)) => {
            error!(error = %e, "filename is too long");
            let _ = out.send_error(Status::InternalServerError, "Filename too long");
            Err(e.into())
        }
        Err(e) => {
            let _ = out.send_error(Status::BadRequest, "Invalid filename");
            Err(e.into())
        }
    }
}

fn resolve_or_reject(storage: &dyn Storage, rel: &str, out: &mut dyn ResponseSink) -> Result<PathBuf> {
    match storage.resolve(rel) {
        Ok(p) => Ok(p),
        Err(e @ StorageError::InvalidPath(_)) => {
            warn!(path = rel, error = %e, "rejected request path");
            let _ = out.send_error(Status::BadRequest, "Invalid filename");
            Err(e.into())
        }
        Err(e) => {
            let _ = out.send_error(Status::InternalServerError, "Failed to resolve path");
            Err(e.into())
        }
    }
}

#[derive(Serialize)]
struct ListingEntry {
    name: String,
    size: u64,
}

/// Stream a directory listing as a JSON array, one chunk per entry.
fn list_directory(ctx: &ServerContext, rel: &str, out: &mut dyn ResponseSink) -> Result<()> {
    let storage = ctx.storage.as_ref();
    if !storage.is_ready() {
        let _ = out.send_error(Status::BadRequest, "Storage not ready");
        bail!("storage not ready");
    }
    let path = resolve_or_reject(storage, rel, out)?;
    let entries = match storage.list_dir(&path) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to list directory");
            let _ = out.send_error(Status::NotFound, "Directory does not exist");
            return Err(e.into());
        }
    };

    out.set_header("Content-Type", "application/json")?;
    out.send_chunk(b"[")?;
    for (i, entry) in entries.into_iter().enumerate() {
        let name = if entry.is_dir {
            format!("{}/", entry.name)
        } else {
            entry.name
        };
        let mut item = if i == 0 { Vec::new() } else { b",".to_vec() };
        serde_json::to_writer(
            &mut item,
            &ListingEntry {
                name,
                size: entry.size,
            },
        )?;
        out.send_chunk(&item)?;
    }
    out.send_chunk(b"]")?;
    out.finish()?;
    Ok(())
}

fn delete_entry(ctx: &ServerContext, rel: &str, out: &mut dyn ResponseSink) -> Result<()> {
    let storage = ctx.storage.as_ref();
    if !storage.is_ready() {
        let _ = out.send_error(Status::BadRequest, "Storage not ready");
        bail!("storage not ready");
    }
    let trimmed = rel.trim_end_matches('/');
    if trimmed.is_empty() {
        let _ = out.send_error(Status::BadRequest, "Invalid filename");
        bail!("refusing to delete the storage root");
    }
    let path = resolve_or_reject(storage, trimmed, out)?;
    let meta = match storage.stat(&path) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %path.display(), "file does not exist");
            let _ = out.send_error(Status::BadRequest, "File does not exist");
            return Err(e.into());
        }
    };

    ctx.status.notify(Some(trimmed), FileOperation::Delete);
    let removed = if meta.is_dir {
        storage.remove_dir(&path)
    } else {
        storage.remove_file(&path)
    };
    ctx.status.notify(None, FileOperation::Idle);

    match removed {
        Ok(()) => {
            info!(path = %path.display(), dir = meta.is_dir, "deleted");
            let message = if meta.is_dir {
                "Directory deleted successfully"
            } else {
                "File deleted successfully"
            };
            out.send_str(Status::Ok, message)?;
            Ok(())
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "delete failed");
            let _ = out.send_error(Status::InternalServerError, "Failed to delete file");
            Err(e.into())
        }
    }
}

/// Web UI assets. Directories are never listed here.
fn serve_static(ctx: &ServerContext, encoded: &str, out: &mut dyn ResponseSink) -> Result<()> {
    let Some(web) = ctx.web.as_deref() else {
        out.send_error(Status::NotFound, "File does not exist")?;
        return Ok(());
    };
    let mut rel = decode_or_reject(ctx, encoded, out)?;
    if rel == "/" {
        rel = "/index.html".to_string();
    }
    if rel.ends_with('/') {
        let _ = out.send_error(Status::NotFound, "File does not exist");
        return Err(anyhow!("directory requested from web root"));
    }
    let path = resolve_or_reject(web, &rel, out)?;
    let target = DownloadTarget {
        storage: web,
        status: &NoopStatusReporter,
        path,
        name: &rel,
    };
    transfer::download(ctx, &target, out)?;
    Ok(())
}
