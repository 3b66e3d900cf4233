//! File-server status notifications
//!
//! Handlers report what they are doing (downloading, uploading, deleting,
//! idle) to a `StatusReporter`. On the device this drives the status line of
//! the display; here the default reporter logs and keeps the latest state.
//! Reporting is fire-and-forget: a handler must never stall on it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Download,
    Upload,
    Delete,
    Idle,
}

/// Observer for file-server activity. Each call corresponds to exactly one
/// state change; implementations must not block.
pub trait StatusReporter: Send + Sync {
    fn notify(&self, path: Option<&str>, op: FileOperation);
}

pub struct NoopStatusReporter;

impl StatusReporter for NoopStatusReporter {
    fn notify(&self, _path: Option<&str>, _op: FileOperation) {}
}

#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub path: Option<String>,
    pub op: FileOperation,
    pub at: DateTime<Utc>,
}

/// Bounded, non-blocking producer feeding a single consumer thread.
///
/// `notify` uses `try_send`; when the queue is full the event is dropped and
/// counted. The consumer applies events in order.
pub struct QueuedStatusReporter {
    tx: SyncSender<StatusEvent>,
    latest: Arc<Mutex<Option<StatusEvent>>>,
    dropped: AtomicU64,
}

impl QueuedStatusReporter {
    /// Start a reporter that logs every status change.
    pub fn spawn(depth: usize) -> anyhow::Result<Self> {
        Self::with_sink(depth, |event: &StatusEvent| {
            info!(
                op = ?event.op,
                path = event.path.as_deref().unwrap_or("-"),
                at = %event.at.to_rfc3339(),
                "status"
            );
        })
    }

    /// Start a reporter whose consumer thread hands each event to `sink`.
    pub fn with_sink<F>(depth: usize, mut sink: F) -> anyhow::Result<Self>
    where
        F: FnMut(&StatusEvent) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<StatusEvent>(depth);
        let latest = Arc::new(Mutex::new(None));
        let latest_consumer = Arc::clone(&latest);
        thread::Builder::new()
            .name("status".to_string())
            .spawn(move || {
                for event in rx {
                    sink(&event);
                    *latest_consumer.lock() = Some(event);
                }
            })?;
        Ok(QueuedStatusReporter {
            tx,
            latest,
            dropped: AtomicU64::new(0),
        })
    }

    /// Most recent event the consumer has applied
    pub fn latest(&self) -> Option<StatusEvent> {
        self.latest.lock().clone()
    }

    /// Events discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl StatusReporter for QueuedStatusReporter {
    fn notify(&self, path: Option<&str>, op: FileOperation) {
        let event = StatusEvent {
            path: path.map(str::to_owned),
            op,
            at: Utc::now(),
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(op = ?event.op, "status queue full; dropping update");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("status consumer has exited");
            }
        }
    }
}

/// Records every notification; test helper shared by the handler tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingReporter {
    events: Mutex<Vec<(Option<String>, FileOperation)>>,
}

#[cfg(test)]
impl RecordingReporter {
    pub(crate) fn events(&self) -> Vec<(Option<String>, FileOperation)> {
        self.events.lock().clone()
    }

    pub(crate) fn count(&self, op: FileOperation) -> usize {
        self.events.lock().iter().filter(|(_, o)| *o == op).count()
    }
}

#[cfg(test)]
impl StatusReporter for RecordingReporter {
    fn notify(&self, path: Option<&str>, op: FileOperation) {
        self.events.lock().push((path.map(str::to_owned), op));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn consumer_applies_events_in_order() {
        let reporter = QueuedStatusReporter::spawn(8).unwrap();
        reporter.notify(Some("/a.bin"), FileOperation::Download);
        reporter.notify(None, FileOperation::Idle);
        assert!(wait_for(|| reporter
            .latest()
            .is_some_and(|e| e.op == FileOperation::Idle)));
        assert_eq!(reporter.dropped(), 0);
    }

    #[test]
    fn saturated_queue_drops_without_blocking() {
        // Consumer parks on the first event until released
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let reporter = QueuedStatusReporter::with_sink(1, move |_e: &StatusEvent| {
            let _ = entered_tx.send(());
            let _ = gate_rx.recv();
        })
        .unwrap();

        reporter.notify(Some("first"), FileOperation::Upload);
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // One fits in the queue, the rest are dropped immediately
        let start = Instant::now();
        reporter.notify(Some("second"), FileOperation::Upload);
        reporter.notify(Some("third"), FileOperation::Upload);
        reporter.notify(Some("fourth"), FileOperation::Upload);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(reporter.dropped(), 2);

        drop(gate_tx);
    }
}
