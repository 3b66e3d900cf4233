//! Server state shared by every request handler
//!
//! Built once by the daemon and handed to the listener; handlers receive it
//! by reference. Nothing here is global.

use crate::config::{Config, TransferConfig};
use crate::status::{QueuedStatusReporter, StatusReporter};
use crate::storage::{LocalStorage, Storage};
use crate::worker::WorkerLimiter;
use anyhow::{Context, Result};
use std::sync::Arc;

pub struct ServerContext {
    /// Served file tree (`/get`, `/upload`, `/delete`)
    pub storage: Arc<dyn Storage>,
    /// Static web UI; `None` disables the fallback route
    pub web: Option<Arc<dyn Storage>>,
    pub status: Arc<dyn StatusReporter>,
    pub transfer: TransferConfig,
    pub limiter: Arc<WorkerLimiter>,
    pub max_path_len: usize,
}

impl ServerContext {
    pub fn new(
        storage: Arc<dyn Storage>,
        status: Arc<dyn StatusReporter>,
        transfer: TransferConfig,
    ) -> Self {
        let limiter = WorkerLimiter::new(transfer.max_workers);
        ServerContext {
            storage,
            web: None,
            status,
            transfer,
            limiter,
            max_path_len: 255,
        }
    }

    pub fn with_web_root(mut self, web: Arc<dyn Storage>) -> Self {
        self.web = Some(web);
        self
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let storage = LocalStorage::new(&config.server.root).with_context(|| {
            format!("open storage root {}", config.server.root.display())
        })?;
        let status = QueuedStatusReporter::spawn(config.status.queue_depth)
            .context("start status reporter")?;
        let mut ctx = ServerContext::new(
            Arc::new(storage),
            Arc::new(status),
            config.transfer.clone(),
        );
        if let Some(web_root) = &config.server.web_root {
            let web = LocalStorage::new(web_root)
                .with_context(|| format!("open web root {}", web_root.display()))?;
            ctx = ctx.with_web_root(Arc::new(web));
        }
        ctx.max_path_len = config.server.max_path_len;
        Ok(ctx)
    }
}
